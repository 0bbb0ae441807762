pub mod types;
pub mod loader;
pub mod validator;
pub mod resolved;
pub mod resolver;
pub mod order;

pub use types::*;
pub use loader::*;
pub use validator::*;
pub use resolved::*;
pub use resolver::*;
pub use order::*;
