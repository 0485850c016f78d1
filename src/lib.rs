pub mod client;
pub mod config;
pub mod connection;
pub mod cookies;
pub mod driver;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod rotator;
pub mod session;
pub mod subscription;

pub use client::{Client, ClientContext, ClientOptions, Transport};
pub use error::{Error, Result};
pub use session::{Session, Status};
pub use subscription::{ItemUpdate, Subscription};
