//! The directory collaborator: the external source of truth for which
//! services exist and which of them this process should read from or write
//! to.

use std::fmt::Debug;

/// Abstraction over the service directory.
///
/// Implementations typically wrap a deployment-management system; the client
/// only ever asks for service names and validity.
pub trait Directory: Send + Sync + Debug {
    /// Services a reader client should query.
    fn get_read_services(&self) -> Vec<String>;

    /// Services a writer client must send data to.
    fn get_write_services(&self) -> Vec<String>;

    /// Write-only services receiving dark traffic; they contribute to writes
    /// but never serve reads.
    fn get_shadow_services(&self) -> Vec<String>;

    /// Whether `name` denotes a service that can currently serve reads.
    fn is_valid_read_service(&self, name: &str) -> bool;

    /// The read service closest to this process, used as a fallback when no
    /// listed service validates.
    fn get_nearest_read_service(&self) -> String;
}

/// Mocks for testing.
pub mod mock {
    use super::*;

    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct State {
        read: Vec<String>,
        write: Vec<String>,
        shadow: Vec<String>,
        invalid: HashSet<String>,
        nearest: String,
    }

    /// A scriptable in-memory [`Directory`].
    ///
    /// Every listed service validates unless explicitly marked invalid.
    #[derive(Debug, Default)]
    pub struct MockDirectory {
        state: Mutex<State>,
    }

    impl MockDirectory {
        /// Set the read services returned by [`Directory::get_read_services`].
        pub fn with_read_services<S: Into<String>>(self, names: impl IntoIterator<Item = S>) -> Self {
            self.state.lock().read = names.into_iter().map(Into::into).collect();
            self
        }

        /// Set the write services.
        pub fn with_write_services<S: Into<String>>(
            self,
            names: impl IntoIterator<Item = S>,
        ) -> Self {
            self.state.lock().write = names.into_iter().map(Into::into).collect();
            self
        }

        /// Set the shadow services.
        pub fn with_shadow_services<S: Into<String>>(
            self,
            names: impl IntoIterator<Item = S>,
        ) -> Self {
            self.state.lock().shadow = names.into_iter().map(Into::into).collect();
            self
        }

        /// Mark `name` as failing validation.
        pub fn with_invalid_service(self, name: impl Into<String>) -> Self {
            self.state.lock().invalid.insert(name.into());
            self
        }

        /// Set the nearest-service fallback.
        pub fn with_nearest_service(self, name: impl Into<String>) -> Self {
            self.state.lock().nearest = name.into();
            self
        }

        /// Replace the read-service list after construction, as a directory
        /// change between refresher ticks would.
        pub fn set_read_services<S: Into<String>>(&self, names: impl IntoIterator<Item = S>) {
            self.state.lock().read = names.into_iter().map(Into::into).collect();
        }
    }

    impl Directory for MockDirectory {
        fn get_read_services(&self) -> Vec<String> {
            self.state.lock().read.clone()
        }

        fn get_write_services(&self) -> Vec<String> {
            self.state.lock().write.clone()
        }

        fn get_shadow_services(&self) -> Vec<String> {
            self.state.lock().shadow.clone()
        }

        fn is_valid_read_service(&self, name: &str) -> bool {
            !self.state.lock().invalid.contains(name)
        }

        fn get_nearest_read_service(&self) -> String {
            self.state.lock().nearest.clone()
        }
    }
}
