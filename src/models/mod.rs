pub mod issue;
pub mod search;
pub mod user;

pub use issue::*;
pub use search::*;
pub use user::*;
