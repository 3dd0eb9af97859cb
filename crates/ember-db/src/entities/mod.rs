pub mod agents;
pub mod allocated_ports;
pub mod character_transfers;
pub mod clusters;
pub mod failover_events;
pub mod install_log_lines;
pub mod install_progress;
pub mod machines;
pub mod port_allocations;
pub mod servers;
pub mod tasks;
