/// Domain browsed when none is configured
pub const DEFAULT_DOMAIN: &str = "local.";

/// Property key queried to check that a backend is alive
pub const VERSION_PROPERTY: &str = "DaemonVersion";

/// Interface index meaning "every interface"
pub const ALL_INTERFACES: u32 = 0;
