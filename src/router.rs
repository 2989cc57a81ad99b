use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the application router with all routes
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::healthcheck))
        // IPAM routes
        .route("/api/ipam/pools", get(handlers::ipam::list_pools))
        .route("/api/ipam/pools", post(handlers::ipam::create_pool))
        .route("/api/ipam/pools/:id", get(handlers::ipam::get_pool))
        .route("/api/ipam/pools/:id", put(handlers::ipam::update_pool))
        .route("/api/ipam/pools/:id", delete(handlers::ipam::delete_pool))
        .route("/api/ipam/pools/:id/available", get(handlers::ipam::available_ips))
        .route("/api/ipam/pools/:id/utilization", get(handlers::ipam::pool_utilization))
        .route("/api/ipam/pools/:id/allocations", get(handlers::ipam::list_allocations))
        .route("/api/ipam/pools/:id/history", get(handlers::ipam::allocation_history))
        .route("/api/ipam/allocations", post(handlers::ipam::allocate_ip))
        .route("/api/ipam/reservations", post(handlers::ipam::reserve_ip))
        .route("/api/ipam/allocations/:id/release", post(handlers::ipam::release_ip))
        .route("/api/ipam/users/:username/allocations", get(handlers::ipam::user_allocations))
        // Router routes
        .route("/api/routers", get(handlers::routers::list_routers))
        .route("/api/routers", post(handlers::routers::create_router))
        .route("/api/routers/:id", get(handlers::routers::get_router))
        .route("/api/routers/:id", delete(handlers::routers::delete_router))
        .route("/api/routers/:id/test", post(handlers::routers::test_router))
        .route("/api/routers/:id/resource", get(handlers::routers::system_resource))
        .route("/api/routers/:id/secrets", get(handlers::routers::list_secrets))
        .route("/api/routers/:id/sessions", get(handlers::routers::active_sessions))
        .route("/api/routers/:id/sessions/:session_id", delete(handlers::routers::disconnect_session))
        .route("/api/routers/:id/profiles", get(handlers::routers::list_profiles))
        .route("/api/routers/:id/profiles", post(handlers::routers::ensure_profile))
        .route("/api/routers/:id/queues", get(handlers::routers::list_queues))
        .route("/api/routers/:id/queues", post(handlers::routers::add_queue))
        .route("/api/routers/:id/firewall", get(handlers::routers::list_firewall_rules))
        .route("/api/routers/:id/firewall", post(handlers::routers::add_firewall_rule))
        .route("/api/routers/:id/reconcile", post(handlers::routers::reconcile_router))
        // Customer mirror and package mappings
        .route("/api/customers", get(handlers::routers::list_customers))
        .route("/api/customers", put(handlers::routers::upsert_customer))
        .route("/api/package-mappings", get(handlers::routers::list_package_mappings))
        .route("/api/package-mappings", post(handlers::routers::create_package_mapping))
        .route("/api/package-mappings/:id", delete(handlers::routers::delete_package_mapping))
        // PPPoE provisioning routes
        .route("/api/pppoe/users", get(handlers::pppoe::list_network_users))
        .route("/api/pppoe/provision", post(handlers::pppoe::provision))
        .route("/api/pppoe/deprovision", post(handlers::pppoe::deprovision))
        .route("/api/pppoe/bulk-provision", post(handlers::pppoe::bulk_provision))
        // OLT routes
        .route("/api/olts", get(handlers::olts::list_olts))
        .route("/api/olts", post(handlers::olts::create_olt))
        .route("/api/olts/:id", get(handlers::olts::get_olt))
        .route("/api/olts/:id/test", post(handlers::olts::test_connection))
        .route("/api/olts/:id/discover", post(handlers::olts::discover_onus))
        .route("/api/olts/:id/sync", post(handlers::olts::sync_onus))
        .route("/api/olts/:id/statistics", get(handlers::olts::statistics))
        .route("/api/olts/:id/onus", get(handlers::olts::list_onus))
        .route("/api/olts/:id/backups", get(handlers::olts::list_backups))
        .route("/api/olts/:id/backups", post(handlers::olts::create_backup))
        .route("/api/olts/:id/configure", post(handlers::olts::apply_configuration))
        .route("/api/olt-backups/:id/export", get(handlers::olts::export_backup))
        // ONU routes
        .route("/api/onus/:id", get(handlers::olts::get_onu))
        .route("/api/onus/:id/status", get(handlers::olts::onu_status))
        .route("/api/onus/:id/refresh", post(handlers::olts::refresh_onu))
        .route("/api/onus/:id/authorize", post(handlers::olts::authorize_onu))
        .route("/api/onus/:id/unauthorize", post(handlers::olts::unauthorize_onu))
        .route("/api/onus/:id/reboot", post(handlers::olts::reboot_onu))
        .route("/api/onus/:id/link", put(handlers::olts::link_onu))
        // RADIUS routes
        .route("/api/radius/test", post(handlers::radius::test_connection))
        .route("/api/radius/users", post(handlers::radius::create_user))
        .route("/api/radius/users/:username", get(handlers::radius::get_user))
        .route("/api/radius/users/:username", put(handlers::radius::update_user))
        .route("/api/radius/users/:username", delete(handlers::radius::delete_user))
        .route("/api/radius/users/:username/disable", post(handlers::radius::disable_user))
        .route("/api/radius/users/:username/enable", post(handlers::radius::enable_user))
        .route("/api/radius/users/:username/sessions", get(handlers::radius::session_history))
        .route("/api/radius/users/:username/usage", get(handlers::radius::usage))
        .route("/api/radius/sync", post(handlers::radius::sync_all))
        .route("/api/radius/authenticate", post(handlers::radius::authenticate))
        .route("/api/radius/accounting/start", post(handlers::radius::accounting_start))
        .route("/api/radius/accounting/update", post(handlers::radius::accounting_update))
        .route("/api/radius/accounting/stop", post(handlers::radius::accounting_stop))
        .route("/api/radius/sessions", get(handlers::radius::active_sessions))
        // Monitoring routes
        .route("/api/monitoring/devices", get(handlers::monitoring::device_statuses))
        .route("/api/monitoring/:kind/:id", get(handlers::monitoring::get_monitor))
        .route("/api/monitoring/:kind/:id/poll", post(handlers::monitoring::monitor_device))
        .route("/api/monitoring/:kind/:id/bandwidth", get(handlers::monitoring::bandwidth_usage))
        .route("/api/monitoring/bandwidth", post(handlers::monitoring::record_bandwidth))
        .route("/api/monitoring/aggregate", post(handlers::monitoring::aggregate_bandwidth))
        // Add state and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}
