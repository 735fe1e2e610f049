pub mod linear;
pub mod mlp;
pub mod module;
pub mod parameter;

pub use linear::Linear;
pub use mlp::Mlp;
pub use module::{Module, StateDict};
pub use parameter::{LocalParam, ParamSlot, ParamState, Parameter};
