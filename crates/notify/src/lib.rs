//! Messaging channels used to reach lab owners.
//!
//! The reconciliation core only ever talks to the [`Messenger`] trait: it
//! resolves an owner key from the lab platform into an [`Identity`] and sends
//! one markdown digest per identity per cycle.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use notify::{Messenger, WebexMessenger};
//!
//! # async fn demo() -> Result<(), notify::ChannelError> {
//! let webex = WebexMessenger::new(
//!     "token",
//!     notify::channels::webex::DEFAULT_API_BASE,
//!     Duration::from_secs(30),
//! )?;
//! let person = webex.resolve_identity("ann@example.com").await?;
//! webex.send(&person, "You have running lab(s)").await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;

pub use channels::webex::WebexMessenger;
pub use channels::{Identity, Messenger};
pub use error::ChannelError;
