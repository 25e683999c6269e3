//! Network proxy (§4.5): a second HTTP listener the agent is pointed at
//! via its proxy environment variables. Handles absolute-form HTTP
//! requests by forwarding them through a downstream client, and `CONNECT`
//! requests by hijacking the socket and tunneling bytes once approved.
//! Both paths funnel through the same bypass-list/rules/mode/queue
//! decision pipeline in [`policy`].

mod body;
mod connect;
mod forward;
mod policy;
mod server;

pub use body::BoxBody;
pub use connect::target_addr;
pub use policy::ProxyVerdict;
pub use policy::decide;
pub use server::ProxyServer;
