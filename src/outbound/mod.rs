//! Upstream ip pools: admission, lifecycle and warm connection caching.

mod active_ip;
mod ip_pool;

pub use active_ip::{ActiveProxyIp, ActiveStatus};
pub use ip_pool::{IpPool, Offer, OfflineLevel, DESTROY_GRACE};
pub(crate) use ip_pool::now_millis;
