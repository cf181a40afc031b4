//! Authentication strategies for SSH connections.
//!
//! Sessions authenticate with a password only. Servers differ in how they ask for it:
//! some accept the `password` method, others only offer `keyboard-interactive` and
//! send a `Password:` prompt. [`AuthChain`] tries each strategy in order and stops at
//! the first success.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: `password` method
//! - [`KeyboardInteractiveAuth`]: `keyboard-interactive` method, answering every
//!   prompt with the password
//!
//! # Example
//!
//! ```ignore
//! let chain = AuthChain::new()
//!     .with_password(password.clone())
//!     .with_keyboard_interactive(password);
//!
//! let accepted = chain.authenticate(&mut handle, "username").await?;
//! ```

mod chain;
mod keyboard;
mod password;
mod traits;

pub use chain::AuthChain;
pub use keyboard::KeyboardInteractiveAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
