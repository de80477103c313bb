mod interface;

pub use interface::{get_interface_ip, service_address};
