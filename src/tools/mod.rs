pub mod dedup;
pub mod echo;
pub mod function;
pub mod gate;
pub mod invoker;
pub mod registry;

pub use dedup::{canonicalize, fingerprint};
pub use echo::EchoTool;
pub use function::{handler_fn, FnHandler};
pub use gate::ConcurrencyGate;
pub use invoker::{InvocationOptions, ToolInvoker};
pub use registry::{ToolHandler, ToolPolicy, ToolRegistration, ToolRegistry};
