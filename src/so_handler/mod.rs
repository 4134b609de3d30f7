//! SO-Handler (C3): dynamic loading of per-package widget code.
//!
//! Loads a package's code module given `(package_id, abi)`. ABI `"c"` maps
//! to the package's own libexec path; any other ABI resolves through an
//! adaptor shared object whose exported symbols take `package_id` as an
//! extra leading argument. See spec.md §4.3 and DESIGN NOTES §9 (the
//! native/adaptor duality collapses to one [`WidgetCapabilities`] trait
//! chosen once at load time).

mod dynload;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Result, WidgetError};
use dynload::{AdaptorModule, NativeModule};

/// The full capability set a package may implement. Every method has a
/// default that returns `NotSupported`, mirroring "missing symbols are
/// tolerated for every capability except create/destroy".
pub trait WidgetCapabilities: Send + Sync {
    fn create(&self, filename: &str, content: &str, cluster: &str, category: &str) -> Result<()>;
    fn destroy(&self, filename: &str, reason: DestroyReason) -> Result<()>;

    fn is_updated(&self, _filename: &str) -> Result<bool> {
        Err(WidgetError::NotSupported("is_updated".into()))
    }
    fn update_content(&self, _filename: &str) -> Result<UpdateResult> {
        Err(WidgetError::NotSupported("update_content".into()))
    }
    fn need_to_destroy(&self, _filename: &str) -> Result<bool> {
        Ok(false)
    }
    fn resize(&self, _filename: &str, _w: i32, _h: i32) -> Result<()> {
        Err(WidgetError::NotSupported("resize".into()))
    }
    fn clicked(&self, _filename: &str, _event: &str, _timestamp: f64, _x: f64, _y: f64) -> Result<()> {
        Err(WidgetError::NotSupported("clicked".into()))
    }
    fn text_signal(&self, _filename: &str, _signal: &str, _source: &str) -> Result<()> {
        Err(WidgetError::NotSupported("text_signal".into()))
    }
    fn create_needed(&self, _cluster: &str, _category: &str) -> Result<bool> {
        Ok(true)
    }
    fn change_group(&self, _filename: &str, _cluster: &str, _category: &str) -> Result<()> {
        Err(WidgetError::NotSupported("change_group".into()))
    }
    fn get_output_info(&self, _filename: &str) -> Result<OutputInfo> {
        Err(WidgetError::NotSupported("get_output_info".into()))
    }
    fn get_alt_info(&self, _filename: &str) -> Result<AltInfo> {
        Err(WidgetError::NotSupported("get_alt_info".into()))
    }
    fn pinup(&self, _filename: &str, _pin: bool) -> Result<String> {
        Err(WidgetError::NotSupported("pinup".into()))
    }
    fn is_pinned_up(&self, _filename: &str) -> Result<bool> {
        Ok(false)
    }
    fn system_event(&self, _filename: &str, _event: SystemEvent) -> Result<()> {
        Err(WidgetError::NotSupported("system_event".into()))
    }
    fn set_content_info(&self, _filename: &str, _content: &str) -> Result<()> {
        Err(WidgetError::NotSupported("set_content_info".into()))
    }

    fn initialize(&self, _package_id: &str) -> Result<()> {
        Ok(())
    }
    /// Returning `Err(WidgetError::ResourceBusy(_))` votes to keep the
    /// module resident; the SO-Handler honors that by not unloading.
    fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Default,
    Uninstall,
    Upgrade,
    Terminate,
    Fault,
    Temporary,
    Unknown,
}

bitflags::bitflags! {
    /// Bitmask returned by `update_content`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateResult: u32 {
        const NEED_TO_SCHEDULE = 0b001;
        const FORCE_TO_SCHEDULE = 0b010;
        const OUTPUT_UPDATED = 0b100;
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputInfo {
    pub width: i32,
    pub height: i32,
    pub priority: f64,
    pub content: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AltInfo {
    pub icon: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Paused,
    Resumed,
    WidgetShow,
    WidgetHide,
    GbarShow,
    GbarHide,
}

/// Which callback is currently executing, process-wide — only one
/// "current operation" at a time (spec.md §3 Package invariants). Used by
/// the begin/end-fault-call bookkeeping so a post-crash supervisor can
/// identify which call was in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentOp {
    None,
    Create,
    Destroy,
    UpdateContent,
    IsUpdated,
    Resize,
    Clicked,
    TextSignal,
    ChangeGroup,
    GetOutputInfo,
    NeedToDestroy,
    Pinup,
    IsPinnedUp,
    SystemEvent,
    GetAltInfo,
    SetContentInfo,
    Initialize,
    Finalize,
}

struct FaultCallState {
    current: CurrentOp,
    package_id: Option<String>,
    instance_id: Option<String>,
}

/// One loaded package: its capability table plus the instances currently
/// using it.
pub struct LoadedPackage {
    pub package_id: String,
    pub timeout_secs: u32,
    pub has_widget_script: bool,
    capabilities: Arc<dyn WidgetCapabilities>,
    instance_count: usize,
}

/// Loads and tracks packages by `package_id`. [`SoHandler::ensure_loaded`]
/// resolves a package's code module via `libloading::Library` keyed by
/// `(package_id, abi)` — see [`dynload`] for the native/adaptor duality;
/// tests instead inject [`WidgetCapabilities`] implementations directly
/// through [`SoHandler::register_for_test`], which is how this module is
/// exercised without a real `.so` on disk.
pub struct SoHandler {
    packages: Mutex<HashMap<String, LoadedPackage>>,
    fault_call: Mutex<FaultCallState>,
    disable_call_option: bool,
}

impl SoHandler {
    pub fn new(disable_call_option: bool) -> Self {
        Self {
            packages: Mutex::new(HashMap::new()),
            fault_call: Mutex::new(FaultCallState { current: CurrentOp::None, package_id: None, instance_id: None }),
            disable_call_option,
        }
    }

    /// Test/embedding seam: register an already-constructed capability
    /// table for a package, skipping `dlopen`. Calls `initialize` exactly
    /// once, per spec.md §3's Package invariant.
    pub async fn register_for_test(&self, package_id: &str, timeout_secs: u32, has_widget_script: bool, capabilities: Arc<dyn WidgetCapabilities>) -> Result<()> {
        self.register_loaded(package_id, timeout_secs, has_widget_script, capabilities).await
    }

    /// Resolves `package_id`'s code module and loads it if not already
    /// resident. ABI `"c"` dlopens the package's own `<package_id>.so`
    /// directly; any other ABI dlopens that ABI's adaptor shared object and
    /// drives it through the adaptor calling convention instead.
    pub async fn ensure_loaded(&self, package_id: &str, timeout_secs: u32, has_widget_script: bool) -> Result<()> {
        if self.is_loaded(package_id).await {
            return Ok(());
        }
        let (abi, packages_root, adaptors_root) = Config::with(|c| (c.abi.clone(), c.packages_root.clone(), c.adaptors_root.clone()));
        let capabilities: Arc<dyn WidgetCapabilities> = if abi == "c" {
            let path = packages_root.join(format!("{package_id}.so"));
            Arc::new(NativeModule::open(&path)?)
        } else {
            let path = adaptors_root.join(format!("{abi}.so"));
            Arc::new(AdaptorModule::open(&path, package_id)?)
        };
        self.register_loaded(package_id, timeout_secs, has_widget_script, capabilities).await
    }

    async fn register_loaded(&self, package_id: &str, timeout_secs: u32, has_widget_script: bool, capabilities: Arc<dyn WidgetCapabilities>) -> Result<()> {
        let mut packages = self.packages.lock().await;
        if packages.contains_key(package_id) {
            return Ok(());
        }
        capabilities.initialize(package_id)?;
        packages.insert(
            package_id.to_string(),
            LoadedPackage { package_id: package_id.to_string(), timeout_secs, has_widget_script, capabilities, instance_count: 0 },
        );
        Ok(())
    }

    pub async fn current_op(&self) -> CurrentOp {
        self.fault_call.lock().await.current
    }

    async fn begin_fault_call(&self, package_id: &str, instance_id: &str, op: CurrentOp) {
        if self.disable_call_option {
            return;
        }
        let mut state = self.fault_call.lock().await;
        state.current = op;
        state.package_id = Some(package_id.to_string());
        state.instance_id = Some(instance_id.to_string());
    }

    async fn end_fault_call(&self) {
        if self.disable_call_option {
            return;
        }
        let mut state = self.fault_call.lock().await;
        state.current = CurrentOp::None;
        state.package_id = None;
        state.instance_id = None;
    }

    async fn with_package<R>(&self, package_id: &str, f: impl FnOnce(&LoadedPackage) -> R) -> Result<R> {
        let packages = self.packages.lock().await;
        let package = packages
            .get(package_id)
            .ok_or_else(|| WidgetError::NotFound(package_id.to_string(), String::new()))?;
        Ok(f(package))
    }

    /// Registers a new instance against its package (bumps the use count
    /// that keeps the package loaded) and invokes `create`.
    pub async fn so_create(&self, package_id: &str, filename: &str, content: &str, cluster: &str, category: &str) -> Result<()> {
        self.begin_fault_call(package_id, filename, CurrentOp::Create).await;
        let result = self.with_package(package_id, |p| p.capabilities.clone()).await?.create(filename, content, cluster, category);
        if result.is_ok() {
            if let Some(p) = self.packages.lock().await.get_mut(package_id) {
                p.instance_count += 1;
            }
        }
        self.end_fault_call().await;
        result
    }

    /// Invokes `destroy` and, if this was the package's last instance,
    /// `finalize`. A `ResourceBusy` from `finalize` keeps the module loaded
    /// (spec.md §3 Package invariants).
    pub async fn so_destroy(&self, package_id: &str, filename: &str, reason: DestroyReason) -> Result<()> {
        self.begin_fault_call(package_id, filename, CurrentOp::Destroy).await;
        let capabilities = self.with_package(package_id, |p| p.capabilities.clone()).await?;
        let result = capabilities.destroy(filename, reason);

        let mut packages = self.packages.lock().await;
        if let Some(p) = packages.get_mut(package_id) {
            p.instance_count = p.instance_count.saturating_sub(1);
            if p.instance_count == 0 {
                match p.capabilities.finalize() {
                    Ok(()) => {
                        packages.remove(package_id);
                    }
                    Err(WidgetError::ResourceBusy(reason)) => {
                        tracing::info!(package_id, reason, "finalize declined, keeping package loaded");
                    }
                    Err(err) => {
                        tracing::warn!(package_id, %err, "finalize failed");
                        packages.remove(package_id);
                    }
                }
            }
        }
        drop(packages);
        self.end_fault_call().await;
        result
    }

    pub async fn so_is_updated(&self, package_id: &str, filename: &str) -> Result<bool> {
        self.begin_fault_call(package_id, filename, CurrentOp::IsUpdated).await;
        let result = self.with_package(package_id, |p| p.capabilities.clone()).await?.is_updated(filename);
        self.end_fault_call().await;
        result
    }

    pub async fn so_update_content(&self, package_id: &str, filename: &str) -> Result<UpdateResult> {
        self.begin_fault_call(package_id, filename, CurrentOp::UpdateContent).await;
        let result = self.with_package(package_id, |p| p.capabilities.clone()).await?.update_content(filename);
        self.end_fault_call().await;
        result
    }

    pub async fn so_need_to_destroy(&self, package_id: &str, filename: &str) -> Result<bool> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.need_to_destroy(filename)
    }

    pub async fn so_resize(&self, package_id: &str, filename: &str, w: i32, h: i32) -> Result<()> {
        self.begin_fault_call(package_id, filename, CurrentOp::Resize).await;
        let result = self.with_package(package_id, |p| p.capabilities.clone()).await?.resize(filename, w, h);
        self.end_fault_call().await;
        result
    }

    pub async fn so_clicked(&self, package_id: &str, filename: &str, event: &str, timestamp: f64, x: f64, y: f64) -> Result<()> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.clicked(filename, event, timestamp, x, y)
    }

    pub async fn so_script_event(&self, package_id: &str, filename: &str, signal: &str, source: &str) -> Result<()> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.text_signal(filename, signal, source)
    }

    pub async fn so_change_group(&self, package_id: &str, filename: &str, cluster: &str, category: &str) -> Result<()> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.change_group(filename, cluster, category)
    }

    pub async fn so_get_output_info(&self, package_id: &str, filename: &str) -> Result<OutputInfo> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.get_output_info(filename)
    }

    pub async fn so_get_alt_info(&self, package_id: &str, filename: &str) -> Result<AltInfo> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.get_alt_info(filename)
    }

    pub async fn so_pinup(&self, package_id: &str, filename: &str, pin: bool) -> Result<String> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.pinup(filename, pin)
    }

    pub async fn so_is_pinned_up(&self, package_id: &str, filename: &str) -> Result<bool> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.is_pinned_up(filename)
    }

    pub async fn so_sys_event(&self, package_id: &str, filename: &str, event: SystemEvent) -> Result<()> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.system_event(filename, event)
    }

    pub async fn so_create_needed(&self, package_id: &str, cluster: &str, category: &str) -> Result<bool> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.create_needed(cluster, category)
    }

    pub async fn so_set_content_info(&self, package_id: &str, filename: &str, content: &str) -> Result<()> {
        self.with_package(package_id, |p| p.capabilities.clone()).await?.set_content_info(filename, content)
    }

    pub async fn package_timeout(&self, package_id: &str) -> Option<u32> {
        self.packages.lock().await.get(package_id).map(|p| p.timeout_secs)
    }

    pub async fn has_widget_script(&self, package_id: &str) -> bool {
        self.packages.lock().await.get(package_id).map(|p| p.has_widget_script).unwrap_or(false)
    }

    pub async fn is_loaded(&self, package_id: &str) -> bool {
        self.packages.lock().await.contains_key(package_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWidget {
        initialize_calls: AtomicUsize,
        finalize_calls: AtomicUsize,
        finalize_busy: bool,
    }

    impl WidgetCapabilities for CountingWidget {
        fn create(&self, _filename: &str, _content: &str, _cluster: &str, _category: &str) -> Result<()> {
            Ok(())
        }
        fn destroy(&self, _filename: &str, _reason: DestroyReason) -> Result<()> {
            Ok(())
        }
        fn initialize(&self, _package_id: &str) -> Result<()> {
            self.initialize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn finalize(&self) -> Result<()> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            if self.finalize_busy {
                Err(WidgetError::ResourceBusy("still painting".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn initialize_called_exactly_once_across_instances() {
        let handler = SoHandler::new(false);
        let widget = Arc::new(CountingWidget {
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            finalize_busy: false,
        });

        handler.register_for_test("pkg", 5, false, widget.clone()).await.unwrap();
        handler.so_create("pkg", "inst1", "", "", "").await.unwrap();
        handler.register_for_test("pkg", 5, false, widget.clone()).await.unwrap();
        handler.so_create("pkg", "inst2", "", "", "").await.unwrap();

        assert_eq!(widget.initialize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalize_resource_busy_keeps_package_loaded() {
        let handler = SoHandler::new(false);
        let widget = Arc::new(CountingWidget {
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            finalize_busy: true,
        });
        handler.register_for_test("pkg", 5, false, widget.clone()).await.unwrap();
        handler.so_create("pkg", "inst1", "", "", "").await.unwrap();
        handler.so_destroy("pkg", "inst1", DestroyReason::Default).await.unwrap();

        assert_eq!(widget.finalize_calls.load(Ordering::SeqCst), 1);
        assert!(handler.is_loaded("pkg").await);
    }

    #[tokio::test]
    async fn finalize_success_unloads_package() {
        let handler = SoHandler::new(false);
        let widget = Arc::new(CountingWidget {
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            finalize_busy: false,
        });
        handler.register_for_test("pkg", 5, false, widget).await.unwrap();
        handler.so_create("pkg", "inst1", "", "", "").await.unwrap();
        handler.so_destroy("pkg", "inst1", DestroyReason::Default).await.unwrap();

        assert!(!handler.is_loaded("pkg").await);
    }

    #[tokio::test]
    async fn missing_capability_defaults_to_not_supported() {
        let handler = SoHandler::new(false);
        let widget = Arc::new(CountingWidget {
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            finalize_busy: false,
        });
        handler.register_for_test("pkg", 5, false, widget).await.unwrap();
        let result = handler.so_resize("pkg", "inst1", 10, 10).await;
        assert!(matches!(result, Err(WidgetError::NotSupported(_))));
    }

    #[tokio::test]
    async fn current_op_tracks_in_flight_call_and_resets() {
        let handler = SoHandler::new(false);
        let widget = Arc::new(CountingWidget {
            initialize_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            finalize_busy: false,
        });
        handler.register_for_test("pkg", 5, false, widget).await.unwrap();
        handler.so_create("pkg", "inst1", "", "", "").await.unwrap();
        assert_eq!(handler.current_op().await, CurrentOp::None);
    }
}
