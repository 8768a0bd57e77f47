//! OS-specific [`RuntimeSource`](crate::RuntimeSource) implementations.

#[cfg(windows)]
mod dac;
pub mod procfs;
#[cfg(windows)]
pub mod win;

/// The attach mechanism for the platform this binary was built for.
#[cfg(windows)]
pub type NativeSource = win::DacSource;

#[cfg(target_os = "linux")]
pub type NativeSource = procfs::ProcfsSource;

#[cfg(not(any(windows, target_os = "linux")))]
pub type NativeSource = unsupported::UnsupportedSource;

#[cfg(not(any(windows, target_os = "linux")))]
mod unsupported {
    use crate::{DiagnosticTarget, Error, Result, RuntimeSource};

    /// Refuses every attach.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UnsupportedSource;

    pub enum Never {}

    impl DiagnosticTarget for Never {
        fn pid(&self) -> u32 {
            match *self {}
        }

        fn runtimes(&self) -> Result<Vec<crate::RuntimeDescriptor>> {
            match *self {}
        }

        fn open_runtime(
            &self,
            _runtime: &crate::RuntimeDescriptor,
        ) -> Result<Box<dyn crate::RuntimeSession + '_>> {
            match *self {}
        }
    }

    impl RuntimeSource for UnsupportedSource {
        type Target = Never;

        fn attach(&self, pid: u32) -> Result<Never> {
            Err(Error::attach(pid, "unsupported platform"))
        }
    }
}
