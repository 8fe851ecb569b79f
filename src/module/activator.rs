//! Dynamic activator entry points
//!
//! A module library exports two C-ABI symbols:
//!
//! - `createModuleActivator() -> *mut c_void` returns an owned activator handle
//! - `destroyModuleActivator(*mut c_void)` releases it
//!
//! The handle is a `Box<Box<dyn ModuleActivator>>` turned into a raw pointer.
//! Module crates built against this one use [`export_module_activator!`]
//! rather than writing the symbols by hand:
//!
//! ```ignore
//! struct Greeter;
//!
//! impl cdmf::module::ModuleActivator for Greeter {
//!     fn start(&self, ctx: &cdmf::module::ModuleContext) -> anyhow::Result<()> { Ok(()) }
//!     fn stop(&self, ctx: &cdmf::module::ModuleContext) -> anyhow::Result<()> { Ok(()) }
//! }
//!
//! cdmf::export_module_activator!(Greeter);
//! ```
//!
//! Both sides must be built with the same compiler and the same version of
//! this crate: the trait object layout is not a stable ABI.

use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::debug;

use super::context::ModuleContext;
use super::traits::ModuleActivator;
use crate::error::{CdmfError, Result};

pub const CREATE_SYMBOL: &[u8] = b"createModuleActivator";
pub const DESTROY_SYMBOL: &[u8] = b"destroyModuleActivator";

pub type CreateActivatorFn = unsafe extern "C" fn() -> *mut c_void;
pub type DestroyActivatorFn = unsafe extern "C" fn(*mut c_void);

/// Export `createModuleActivator` / `destroyModuleActivator` for an activator
///
/// The argument is an expression producing the activator value.
#[macro_export]
macro_rules! export_module_activator {
    ($ctor:expr) => {
        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn createModuleActivator() -> *mut ::std::ffi::c_void {
            let activator: ::std::boxed::Box<dyn $crate::module::ModuleActivator> =
                ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(activator)) as *mut ::std::ffi::c_void
        }

        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn destroyModuleActivator(handle: *mut ::std::ffi::c_void) {
            if !handle.is_null() {
                drop(::std::boxed::Box::from_raw(
                    handle as *mut ::std::boxed::Box<dyn $crate::module::ModuleActivator>,
                ));
            }
        }
    };
}

/// Activator living in a dynamically loaded library
///
/// Dropping it calls `destroyModuleActivator` before the library is
/// released.
pub struct DynamicActivator {
    handle: NonNull<Box<dyn ModuleActivator>>,
    destroy: DestroyActivatorFn,
    // Declared last so it drops after `handle` has been destroyed
    _library: Arc<Library>,
}

// The handle points at a `Box<dyn ModuleActivator>`, which is Send + Sync.
unsafe impl Send for DynamicActivator {}
unsafe impl Sync for DynamicActivator {}

impl DynamicActivator {
    /// Open `path` and create its activator
    pub fn load(path: &Path) -> Result<Self> {
        // SAFETY: loading a library runs its initialisers; module artifacts
        // are verified before they reach this point.
        let library = unsafe { Library::new(path) }?;

        let (create, destroy) = unsafe {
            let create: Symbol<CreateActivatorFn> = library.get(CREATE_SYMBOL)?;
            let destroy: Symbol<DestroyActivatorFn> = library.get(DESTROY_SYMBOL)?;
            (*create, *destroy)
        };

        let raw = unsafe { create() } as *mut Box<dyn ModuleActivator>;
        let handle = NonNull::new(raw).ok_or_else(|| {
            CdmfError::ArtifactLoad(format!(
                "{} returned a null activator",
                path.display()
            ))
        })?;

        debug!("Created activator from {}", path.display());
        Ok(Self {
            handle,
            destroy,
            _library: Arc::new(library),
        })
    }

    fn activator(&self) -> &dyn ModuleActivator {
        // SAFETY: `handle` stays valid until `drop` hands it back.
        unsafe { self.handle.as_ref().as_ref() }
    }
}

impl ModuleActivator for DynamicActivator {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.activator().start(context)
    }

    fn stop(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.activator().stop(context)
    }
}

impl Drop for DynamicActivator {
    fn drop(&mut self) {
        // SAFETY: the handle came from this library's create function and
        // is destroyed exactly once.
        unsafe { (self.destroy)(self.handle.as_ptr() as *mut c_void) };
    }
}

/// Load the activator exported by the library at `path`
pub fn load_activator(path: &Path) -> Result<Arc<dyn ModuleActivator>> {
    Ok(Arc::new(DynamicActivator::load(path)?))
}
