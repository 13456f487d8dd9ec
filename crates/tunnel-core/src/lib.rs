pub mod error;
pub mod io_mode;
pub mod relay;
pub mod state;

pub use error::{SshCoreError, SshResult};
pub use io_mode::{IoMode, NonBlockingScope};
