use sqlx::{Row, sqlite::SqliteRow};

use crate::models::*;

/// Filter empty strings to None; the schema stores '' for unset text
pub fn none_if_empty(opt: Option<String>) -> Option<String> {
    opt.filter(|s| !s.is_empty())
}

pub fn map_pool_row(row: &SqliteRow) -> IpPool {
    let range_start_int: i64 = row.get("range_start_int");
    let range_end_int: i64 = row.get("range_end_int");
    IpPool {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        cidr: row.get("cidr"),
        network_int: row.get("network_int"),
        broadcast_int: row.get("broadcast_int"),
        prefix_length: row.get("prefix_length"),
        range_start: crate::utils::u32_to_ipv4(range_start_int as u32),
        range_end: crate::utils::u32_to_ipv4(range_end_int as u32),
        range_start_int,
        range_end_int,
        gateway: none_if_empty(row.get("gateway")),
        dns_primary: none_if_empty(row.get("dns_primary")),
        dns_secondary: none_if_empty(row.get("dns_secondary")),
        description: none_if_empty(row.get("description")),
        allow_shared_mac: row.get("allow_shared_mac"),
        status: row.get("status"),
        active_allocations: row.try_get("active_allocations").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_allocation_row(row: &SqliteRow) -> IpAllocation {
    IpAllocation {
        id: row.get("id"),
        pool_id: row.get("pool_id"),
        tenant_id: row.get("tenant_id"),
        address: row.get("address"),
        address_int: row.get("address_int"),
        mac_address: row.get("mac_address"),
        username: row.get("username"),
        status: row.get("status"),
        allocated_at: row.get("allocated_at"),
        released_at: row.get("released_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_history_row(row: &SqliteRow) -> AllocationHistoryEntry {
    AllocationHistoryEntry {
        id: row.get("id"),
        allocation_id: row.get("allocation_id"),
        pool_id: row.get("pool_id"),
        address: row.get("address"),
        mac_address: row.get("mac_address"),
        username: row.get("username"),
        action: row.get("action"),
        created_at: row.get("created_at"),
    }
}

pub fn map_router_row(row: &SqliteRow) -> Router {
    Router {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        host: row.get("host"),
        api_port: row.get::<i64, _>("api_port") as u16,
        username: row.get("username"),
        password: row.get("password"),
        vendor: row.get("vendor"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_customer_row(row: &SqliteRow) -> Customer {
    Customer {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        username: row.get("username"),
        password: row.get("password"),
        mac_address: none_if_empty(row.get("mac_address")),
        package_id: row.get("package_id"),
        expiry_date: row.get("expiry_date"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_mapping_row(row: &SqliteRow) -> PackageProfileMapping {
    PackageProfileMapping {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        package_id: row.get("package_id"),
        router_id: row.get("router_id"),
        profile_name: row.get("profile_name"),
        ip_pool_id: row.get("ip_pool_id"),
        speed_control_method: none_if_empty(row.get("speed_control_method")),
        rate_limit: none_if_empty(row.get("rate_limit")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_network_user_row(row: &SqliteRow) -> NetworkUser {
    NetworkUser {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        customer_id: row.get("customer_id"),
        router_id: row.get("router_id"),
        username: row.get("username"),
        password: row.get("password"),
        profile: row.get("profile"),
        service_type: row.get("service_type"),
        static_ip: none_if_empty(row.get("static_ip")),
        allocation_id: row.get("allocation_id"),
        package_id: row.get("package_id"),
        expiry_date: row.get("expiry_date"),
        router_comment: row.get("router_comment"),
        state: row.get("state"),
        last_error: none_if_empty(row.get("last_error")),
        provisioned_at: row.get("provisioned_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_olt_row(row: &SqliteRow) -> Olt {
    Olt {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        ip_address: row.get("ip_address"),
        brand: row.get("brand"),
        model: row.get("model"),
        vendor: row.get("vendor"),
        management_protocol: row.get("management_protocol"),
        ssh_port: row.get::<i64, _>("ssh_port") as u16,
        username: row.get("username"),
        password: row.get("password"),
        snmp_community: row.get("snmp_community"),
        snmp_port: row.get::<i64, _>("snmp_port") as u16,
        pon_port_count: row.get("pon_port_count"),
        max_onus: row.get("max_onus"),
        status: row.get("status"),
        uptime_seconds: row.get("uptime_seconds"),
        temperature: row.get("temperature"),
        cpu_usage: row.get("cpu_usage"),
        memory_usage: row.get("memory_usage"),
        last_polled_at: row.get("last_polled_at"),
        last_sync_at: row.get("last_sync_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_onu_row(row: &SqliteRow) -> Onu {
    Onu {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        olt_id: row.get("olt_id"),
        serial_number: row.get("serial_number"),
        pon_port: row.get("pon_port"),
        onu_id: row.get("onu_id"),
        status: row.get("status"),
        auth_state: row.get("auth_state"),
        signal_rx: row.get("signal_rx"),
        signal_tx: row.get("signal_tx"),
        distance: row.get("distance"),
        network_user_id: row.get("network_user_id"),
        last_seen_at: row.get("last_seen_at"),
        last_status_at: row.get("last_status_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn map_backup_row(row: &SqliteRow) -> OltBackup {
    OltBackup {
        id: row.get("id"),
        olt_id: row.get("olt_id"),
        filename: row.get("filename"),
        size: row.get("size"),
        created_at: row.get("created_at"),
    }
}

pub fn map_monitor_row(row: &SqliteRow) -> DeviceMonitor {
    DeviceMonitor {
        id: row.get("id"),
        device_type: row.get("device_type"),
        device_id: row.get("device_id"),
        status: row.get("status"),
        consecutive_failures: row.get("consecutive_failures"),
        cpu_usage: row.get("cpu_usage"),
        memory_usage: row.get("memory_usage"),
        uptime_seconds: row.get("uptime_seconds"),
        last_error: none_if_empty(row.get("last_error")),
        last_check_at: row.get("last_check_at"),
    }
}

pub fn map_bandwidth_row(row: &SqliteRow) -> BandwidthPoint {
    BandwidthPoint {
        period_start: row.get("period_start"),
        upload_bytes: row.get("upload_bytes"),
        download_bytes: row.get("download_bytes"),
        total_bytes: row.get("total_bytes"),
        samples: row.get("samples"),
    }
}
