pub mod rate;
pub mod security;
pub mod ses;

pub use rate::*;
pub use security::*;
pub use ses::*;
