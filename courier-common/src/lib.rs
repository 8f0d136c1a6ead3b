pub mod logging;
pub mod tenant;

pub use tenant::TenantId;
pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
