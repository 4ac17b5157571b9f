//! Guest ABI adapters for wasmpipe.
//!
//! Three adapter variants translate between the HTTP exchange and a
//! guest's calling convention:
//! - [`NativeAdapter`]: exported request/response hook functions
//! - [`StdioAdapter`]: one-shot JSON envelope over standard input/output
//! - [`CgiAdapter`]: CGI environment variables and stdout parsing
//!
//! All three produce the same [`InstanceFactory`] shape, selected once at
//! provisioning time by the stage's builder discriminator.

pub mod adapter;
pub mod cgi;
pub mod envelope;
pub mod native;
pub mod stdio;

pub use adapter::{
    make_factory, pooled, GuestHandler, InstanceFactory, PooledInstance, Served,
};
pub use cgi::CgiAdapter;
pub use envelope::{Envelope, GuestRequest, GuestResponse};
pub use native::NativeAdapter;
pub use stdio::StdioAdapter;
