//! `dlopen`-backed [`WidgetCapabilities`] implementations.
//!
//! Native packages (ABI `"c"`) export their symbols directly; every other
//! ABI resolves through an adaptor shared object whose exported symbols take
//! `package_id` as an extra leading argument, so one package binary can be
//! driven by several different adaptor runtimes without recompiling it.
//! Only `widget_create`/`widget_destroy` are mandatory — every other symbol
//! is optional and its absence falls back to the trait's default.

use std::ffi::{c_char, c_int, CString};
use std::path::Path;

use libloading::{Library, Symbol};

use super::{AltInfo, DestroyReason, OutputInfo, SystemEvent, UpdateResult, WidgetCapabilities};
use crate::error::{Result, WidgetError};

const URI_BUF_CAP: usize = 4096;
const TEXT_BUF_CAP: usize = 1024;

fn cstr(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| WidgetError::InvalidArgument(format!("{s:?} contains an interior NUL")))
}

fn status(code: c_int, context: &str) -> Result<()> {
    if code >= 0 {
        Ok(())
    } else {
        Err(WidgetError::Fault(format!("{context} returned {code}")))
    }
}

/// Reads a NUL-terminated string out of a fixed-capacity buffer the callee
/// wrote into. Buffers cross the FFI boundary by reference, not by
/// ownership, so there's no callee-side allocator to free through.
fn buf_to_string(buf: &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0)?;
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn destroy_reason_code(reason: DestroyReason) -> c_int {
    match reason {
        DestroyReason::Default => 0,
        DestroyReason::Uninstall => 1,
        DestroyReason::Upgrade => 2,
        DestroyReason::Terminate => 3,
        DestroyReason::Fault => 4,
        DestroyReason::Temporary => 5,
        DestroyReason::Unknown => 6,
    }
}

fn system_event_code(event: SystemEvent) -> c_int {
    match event {
        SystemEvent::Paused => 0,
        SystemEvent::Resumed => 1,
        SystemEvent::WidgetShow => 2,
        SystemEvent::WidgetHide => 3,
        SystemEvent::GbarShow => 4,
        SystemEvent::GbarHide => 5,
    }
}

mod sym {
    pub const CREATE: &[u8] = b"widget_create\0";
    pub const DESTROY: &[u8] = b"widget_destroy\0";
    pub const IS_UPDATED: &[u8] = b"widget_is_updated\0";
    pub const UPDATE_CONTENT: &[u8] = b"widget_update_content\0";
    pub const NEED_TO_DESTROY: &[u8] = b"widget_need_to_destroy\0";
    pub const RESIZE: &[u8] = b"widget_resize\0";
    pub const CLICKED: &[u8] = b"widget_clicked\0";
    pub const TEXT_SIGNAL: &[u8] = b"widget_text_signal\0";
    pub const CREATE_NEEDED: &[u8] = b"widget_create_needed\0";
    pub const CHANGE_GROUP: &[u8] = b"widget_change_group\0";
    pub const GET_OUTPUT_INFO: &[u8] = b"widget_get_output_info\0";
    pub const GET_ALT_INFO: &[u8] = b"widget_get_alt_info\0";
    pub const PINUP: &[u8] = b"widget_pinup\0";
    pub const IS_PINNED_UP: &[u8] = b"widget_is_pinned_up\0";
    pub const SYSTEM_EVENT: &[u8] = b"widget_system_event\0";
    pub const SET_CONTENT_INFO: &[u8] = b"widget_set_content_info\0";
    pub const INITIALIZE: &[u8] = b"widget_initialize\0";
    pub const FINALIZE: &[u8] = b"widget_finalize\0";
}

type NCreate = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, *const c_char) -> c_int;
type ACreate = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, *const c_char, *const c_char) -> c_int;
type NDestroy = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type ADestroy = unsafe extern "C" fn(*const c_char, *const c_char, c_int) -> c_int;
type NIsUpdated = unsafe extern "C" fn(*const c_char, *mut c_int) -> c_int;
type AIsUpdated = unsafe extern "C" fn(*const c_char, *const c_char, *mut c_int) -> c_int;
type NUpdateContent = unsafe extern "C" fn(*const c_char, *mut u32) -> c_int;
type AUpdateContent = unsafe extern "C" fn(*const c_char, *const c_char, *mut u32) -> c_int;
type NNeedToDestroy = unsafe extern "C" fn(*const c_char, *mut c_int) -> c_int;
type ANeedToDestroy = unsafe extern "C" fn(*const c_char, *const c_char, *mut c_int) -> c_int;
type NResize = unsafe extern "C" fn(*const c_char, i32, i32) -> c_int;
type AResize = unsafe extern "C" fn(*const c_char, *const c_char, i32, i32) -> c_int;
type NClicked = unsafe extern "C" fn(*const c_char, *const c_char, f64, f64, f64) -> c_int;
type AClicked = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, f64, f64, f64) -> c_int;
type NTextSignal = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char) -> c_int;
type ATextSignal = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, *const c_char) -> c_int;
type NCreateNeeded = unsafe extern "C" fn(*const c_char, *const c_char, *mut c_int) -> c_int;
type ACreateNeeded = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, *mut c_int) -> c_int;
type NChangeGroup = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char) -> c_int;
type AChangeGroup = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, *const c_char) -> c_int;
type NGetOutputInfo =
    unsafe extern "C" fn(*const c_char, *mut i32, *mut i32, *mut f64, *mut c_char, usize, *mut c_char, usize) -> c_int;
type AGetOutputInfo = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *mut i32,
    *mut i32,
    *mut f64,
    *mut c_char,
    usize,
    *mut c_char,
    usize,
) -> c_int;
type NGetAltInfo = unsafe extern "C" fn(*const c_char, *mut c_char, usize, *mut c_char, usize) -> c_int;
type AGetAltInfo = unsafe extern "C" fn(*const c_char, *const c_char, *mut c_char, usize, *mut c_char, usize) -> c_int;
type NPinup = unsafe extern "C" fn(*const c_char, c_int, *mut c_char, usize) -> c_int;
type APinup = unsafe extern "C" fn(*const c_char, *const c_char, c_int, *mut c_char, usize) -> c_int;
type NIsPinnedUp = unsafe extern "C" fn(*const c_char, *mut c_int) -> c_int;
type AIsPinnedUp = unsafe extern "C" fn(*const c_char, *const c_char, *mut c_int) -> c_int;
type NSystemEvent = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type ASystemEvent = unsafe extern "C" fn(*const c_char, *const c_char, c_int) -> c_int;
type NSetContentInfo = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
type ASetContentInfo = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char) -> c_int;
type FnInitialize = unsafe extern "C" fn(*const c_char) -> c_int;
type NFinalize = unsafe extern "C" fn() -> c_int;
type AFinalize = unsafe extern "C" fn(*const c_char) -> c_int;

/// Looks up `name` in `lib` and copies the function pointer out, leaving no
/// borrow tied to the `Library`'s lifetime; absent symbols are `None`.
unsafe fn optional<T: Copy>(lib: &Library, name: &[u8]) -> Option<T> {
    lib.get::<T>(name).ok().map(|sym: Symbol<T>| *sym)
}

unsafe fn required<T: Copy>(lib: &Library, name: &[u8]) -> Result<T> {
    optional(lib, name).ok_or_else(|| {
        WidgetError::Fault(format!("missing mandatory symbol {}", String::from_utf8_lossy(&name[..name.len() - 1])))
    })
}

pub struct NativeModule {
    _lib: Library,
    create: NCreate,
    destroy: NDestroy,
    is_updated: Option<NIsUpdated>,
    update_content: Option<NUpdateContent>,
    need_to_destroy: Option<NNeedToDestroy>,
    resize: Option<NResize>,
    clicked: Option<NClicked>,
    text_signal: Option<NTextSignal>,
    create_needed: Option<NCreateNeeded>,
    change_group: Option<NChangeGroup>,
    get_output_info: Option<NGetOutputInfo>,
    get_alt_info: Option<NGetAltInfo>,
    pinup: Option<NPinup>,
    is_pinned_up: Option<NIsPinnedUp>,
    system_event: Option<NSystemEvent>,
    set_content_info: Option<NSetContentInfo>,
    initialize: Option<FnInitialize>,
    finalize: Option<NFinalize>,
}

impl NativeModule {
    pub fn open(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }.map_err(|err| WidgetError::Fault(format!("dlopen {}: {err}", path.display())))?;
        unsafe {
            Ok(Self {
                create: required(&lib, sym::CREATE)?,
                destroy: required(&lib, sym::DESTROY)?,
                is_updated: optional(&lib, sym::IS_UPDATED),
                update_content: optional(&lib, sym::UPDATE_CONTENT),
                need_to_destroy: optional(&lib, sym::NEED_TO_DESTROY),
                resize: optional(&lib, sym::RESIZE),
                clicked: optional(&lib, sym::CLICKED),
                text_signal: optional(&lib, sym::TEXT_SIGNAL),
                create_needed: optional(&lib, sym::CREATE_NEEDED),
                change_group: optional(&lib, sym::CHANGE_GROUP),
                get_output_info: optional(&lib, sym::GET_OUTPUT_INFO),
                get_alt_info: optional(&lib, sym::GET_ALT_INFO),
                pinup: optional(&lib, sym::PINUP),
                is_pinned_up: optional(&lib, sym::IS_PINNED_UP),
                system_event: optional(&lib, sym::SYSTEM_EVENT),
                set_content_info: optional(&lib, sym::SET_CONTENT_INFO),
                initialize: optional(&lib, sym::INITIALIZE),
                finalize: optional(&lib, sym::FINALIZE),
                _lib: lib,
            })
        }
    }
}

impl WidgetCapabilities for NativeModule {
    fn create(&self, filename: &str, content: &str, cluster: &str, category: &str) -> Result<()> {
        let (filename, content, cluster, category) = (cstr(filename)?, cstr(content)?, cstr(cluster)?, cstr(category)?);
        let code = unsafe { (self.create)(filename.as_ptr(), content.as_ptr(), cluster.as_ptr(), category.as_ptr()) };
        status(code, "widget_create")
    }

    fn destroy(&self, filename: &str, reason: DestroyReason) -> Result<()> {
        let filename = cstr(filename)?;
        let code = unsafe { (self.destroy)(filename.as_ptr(), destroy_reason_code(reason)) };
        status(code, "widget_destroy")
    }

    fn is_updated(&self, filename: &str) -> Result<bool> {
        let Some(f) = self.is_updated else { return Err(WidgetError::NotSupported("is_updated".into())) };
        let filename = cstr(filename)?;
        let mut out: c_int = 0;
        let code = unsafe { f(filename.as_ptr(), &mut out) };
        status(code, "widget_is_updated")?;
        Ok(out != 0)
    }

    fn update_content(&self, filename: &str) -> Result<UpdateResult> {
        let Some(f) = self.update_content else { return Err(WidgetError::NotSupported("update_content".into())) };
        let filename = cstr(filename)?;
        let mut flags: u32 = 0;
        let code = unsafe { f(filename.as_ptr(), &mut flags) };
        status(code, "widget_update_content")?;
        Ok(UpdateResult::from_bits_truncate(flags))
    }

    fn need_to_destroy(&self, filename: &str) -> Result<bool> {
        let Some(f) = self.need_to_destroy else { return Ok(false) };
        let filename = cstr(filename)?;
        let mut out: c_int = 0;
        let code = unsafe { f(filename.as_ptr(), &mut out) };
        status(code, "widget_need_to_destroy")?;
        Ok(out != 0)
    }

    fn resize(&self, filename: &str, w: i32, h: i32) -> Result<()> {
        let Some(f) = self.resize else { return Err(WidgetError::NotSupported("resize".into())) };
        let filename = cstr(filename)?;
        status(unsafe { f(filename.as_ptr(), w, h) }, "widget_resize")
    }

    fn clicked(&self, filename: &str, event: &str, timestamp: f64, x: f64, y: f64) -> Result<()> {
        let Some(f) = self.clicked else { return Err(WidgetError::NotSupported("clicked".into())) };
        let (filename, event) = (cstr(filename)?, cstr(event)?);
        status(unsafe { f(filename.as_ptr(), event.as_ptr(), timestamp, x, y) }, "widget_clicked")
    }

    fn text_signal(&self, filename: &str, signal: &str, source: &str) -> Result<()> {
        let Some(f) = self.text_signal else { return Err(WidgetError::NotSupported("text_signal".into())) };
        let (filename, signal, source) = (cstr(filename)?, cstr(signal)?, cstr(source)?);
        status(unsafe { f(filename.as_ptr(), signal.as_ptr(), source.as_ptr()) }, "widget_text_signal")
    }

    fn create_needed(&self, cluster: &str, category: &str) -> Result<bool> {
        let Some(f) = self.create_needed else { return Ok(true) };
        let (cluster, category) = (cstr(cluster)?, cstr(category)?);
        let mut out: c_int = 1;
        let code = unsafe { f(cluster.as_ptr(), category.as_ptr(), &mut out) };
        status(code, "widget_create_needed")?;
        Ok(out != 0)
    }

    fn change_group(&self, filename: &str, cluster: &str, category: &str) -> Result<()> {
        let Some(f) = self.change_group else { return Err(WidgetError::NotSupported("change_group".into())) };
        let (filename, cluster, category) = (cstr(filename)?, cstr(cluster)?, cstr(category)?);
        status(unsafe { f(filename.as_ptr(), cluster.as_ptr(), category.as_ptr()) }, "widget_change_group")
    }

    fn get_output_info(&self, filename: &str) -> Result<OutputInfo> {
        let Some(f) = self.get_output_info else { return Err(WidgetError::NotSupported("get_output_info".into())) };
        let filename = cstr(filename)?;
        let (mut width, mut height, mut priority) = (0i32, 0i32, 0f64);
        let mut content_buf = [0u8; TEXT_BUF_CAP];
        let mut title_buf = [0u8; TEXT_BUF_CAP];
        let code = unsafe {
            f(
                filename.as_ptr(),
                &mut width,
                &mut height,
                &mut priority,
                content_buf.as_mut_ptr() as *mut c_char,
                content_buf.len(),
                title_buf.as_mut_ptr() as *mut c_char,
                title_buf.len(),
            )
        };
        status(code, "widget_get_output_info")?;
        Ok(OutputInfo { width, height, priority, content: buf_to_string(&content_buf), title: buf_to_string(&title_buf) })
    }

    fn get_alt_info(&self, filename: &str) -> Result<AltInfo> {
        let Some(f) = self.get_alt_info else { return Err(WidgetError::NotSupported("get_alt_info".into())) };
        let filename = cstr(filename)?;
        let mut icon_buf = [0u8; TEXT_BUF_CAP];
        let mut name_buf = [0u8; TEXT_BUF_CAP];
        let code = unsafe {
            f(
                filename.as_ptr(),
                icon_buf.as_mut_ptr() as *mut c_char,
                icon_buf.len(),
                name_buf.as_mut_ptr() as *mut c_char,
                name_buf.len(),
            )
        };
        status(code, "widget_get_alt_info")?;
        Ok(AltInfo { icon: buf_to_string(&icon_buf), name: buf_to_string(&name_buf) })
    }

    fn pinup(&self, filename: &str, pin: bool) -> Result<String> {
        let Some(f) = self.pinup else { return Err(WidgetError::NotSupported("pinup".into())) };
        let filename = cstr(filename)?;
        let mut uri_buf = [0u8; URI_BUF_CAP];
        let code = unsafe { f(filename.as_ptr(), pin as c_int, uri_buf.as_mut_ptr() as *mut c_char, uri_buf.len()) };
        status(code, "widget_pinup")?;
        Ok(buf_to_string(&uri_buf).unwrap_or_default())
    }

    fn is_pinned_up(&self, filename: &str) -> Result<bool> {
        let Some(f) = self.is_pinned_up else { return Ok(false) };
        let filename = cstr(filename)?;
        let mut out: c_int = 0;
        let code = unsafe { f(filename.as_ptr(), &mut out) };
        status(code, "widget_is_pinned_up")?;
        Ok(out != 0)
    }

    fn system_event(&self, filename: &str, event: SystemEvent) -> Result<()> {
        let Some(f) = self.system_event else { return Err(WidgetError::NotSupported("system_event".into())) };
        let filename = cstr(filename)?;
        status(unsafe { f(filename.as_ptr(), system_event_code(event)) }, "widget_system_event")
    }

    fn set_content_info(&self, filename: &str, content: &str) -> Result<()> {
        let Some(f) = self.set_content_info else { return Err(WidgetError::NotSupported("set_content_info".into())) };
        let (filename, content) = (cstr(filename)?, cstr(content)?);
        status(unsafe { f(filename.as_ptr(), content.as_ptr()) }, "widget_set_content_info")
    }

    fn initialize(&self, package_id: &str) -> Result<()> {
        let Some(f) = self.initialize else { return Ok(()) };
        let package_id = cstr(package_id)?;
        status(unsafe { f(package_id.as_ptr()) }, "widget_initialize")
    }

    fn finalize(&self) -> Result<()> {
        let Some(f) = self.finalize else { return Ok(()) };
        status(unsafe { f() }, "widget_finalize")
    }
}

pub struct AdaptorModule {
    _lib: Library,
    package_id: CString,
    create: ACreate,
    destroy: ADestroy,
    is_updated: Option<AIsUpdated>,
    update_content: Option<AUpdateContent>,
    need_to_destroy: Option<ANeedToDestroy>,
    resize: Option<AResize>,
    clicked: Option<AClicked>,
    text_signal: Option<ATextSignal>,
    create_needed: Option<ACreateNeeded>,
    change_group: Option<AChangeGroup>,
    get_output_info: Option<AGetOutputInfo>,
    get_alt_info: Option<AGetAltInfo>,
    pinup: Option<APinup>,
    is_pinned_up: Option<AIsPinnedUp>,
    system_event: Option<ASystemEvent>,
    set_content_info: Option<ASetContentInfo>,
    initialize: Option<FnInitialize>,
    finalize: Option<AFinalize>,
}

impl AdaptorModule {
    pub fn open(path: &Path, package_id: &str) -> Result<Self> {
        let lib = unsafe { Library::new(path) }.map_err(|err| WidgetError::Fault(format!("dlopen {}: {err}", path.display())))?;
        let package_id = cstr(package_id)?;
        unsafe {
            Ok(Self {
                create: required(&lib, sym::CREATE)?,
                destroy: required(&lib, sym::DESTROY)?,
                is_updated: optional(&lib, sym::IS_UPDATED),
                update_content: optional(&lib, sym::UPDATE_CONTENT),
                need_to_destroy: optional(&lib, sym::NEED_TO_DESTROY),
                resize: optional(&lib, sym::RESIZE),
                clicked: optional(&lib, sym::CLICKED),
                text_signal: optional(&lib, sym::TEXT_SIGNAL),
                create_needed: optional(&lib, sym::CREATE_NEEDED),
                change_group: optional(&lib, sym::CHANGE_GROUP),
                get_output_info: optional(&lib, sym::GET_OUTPUT_INFO),
                get_alt_info: optional(&lib, sym::GET_ALT_INFO),
                pinup: optional(&lib, sym::PINUP),
                is_pinned_up: optional(&lib, sym::IS_PINNED_UP),
                system_event: optional(&lib, sym::SYSTEM_EVENT),
                set_content_info: optional(&lib, sym::SET_CONTENT_INFO),
                initialize: optional(&lib, sym::INITIALIZE),
                finalize: optional(&lib, sym::FINALIZE),
                package_id,
                _lib: lib,
            })
        }
    }

    fn pid(&self) -> *const c_char {
        self.package_id.as_ptr()
    }
}

impl WidgetCapabilities for AdaptorModule {
    fn create(&self, filename: &str, content: &str, cluster: &str, category: &str) -> Result<()> {
        let (filename, content, cluster, category) = (cstr(filename)?, cstr(content)?, cstr(cluster)?, cstr(category)?);
        let code = unsafe { (self.create)(self.pid(), filename.as_ptr(), content.as_ptr(), cluster.as_ptr(), category.as_ptr()) };
        status(code, "widget_create")
    }

    fn destroy(&self, filename: &str, reason: DestroyReason) -> Result<()> {
        let filename = cstr(filename)?;
        let code = unsafe { (self.destroy)(self.pid(), filename.as_ptr(), destroy_reason_code(reason)) };
        status(code, "widget_destroy")
    }

    fn is_updated(&self, filename: &str) -> Result<bool> {
        let Some(f) = self.is_updated else { return Err(WidgetError::NotSupported("is_updated".into())) };
        let filename = cstr(filename)?;
        let mut out: c_int = 0;
        let code = unsafe { f(self.pid(), filename.as_ptr(), &mut out) };
        status(code, "widget_is_updated")?;
        Ok(out != 0)
    }

    fn update_content(&self, filename: &str) -> Result<UpdateResult> {
        let Some(f) = self.update_content else { return Err(WidgetError::NotSupported("update_content".into())) };
        let filename = cstr(filename)?;
        let mut flags: u32 = 0;
        let code = unsafe { f(self.pid(), filename.as_ptr(), &mut flags) };
        status(code, "widget_update_content")?;
        Ok(UpdateResult::from_bits_truncate(flags))
    }

    fn need_to_destroy(&self, filename: &str) -> Result<bool> {
        let Some(f) = self.need_to_destroy else { return Ok(false) };
        let filename = cstr(filename)?;
        let mut out: c_int = 0;
        let code = unsafe { f(self.pid(), filename.as_ptr(), &mut out) };
        status(code, "widget_need_to_destroy")?;
        Ok(out != 0)
    }

    fn resize(&self, filename: &str, w: i32, h: i32) -> Result<()> {
        let Some(f) = self.resize else { return Err(WidgetError::NotSupported("resize".into())) };
        let filename = cstr(filename)?;
        status(unsafe { f(self.pid(), filename.as_ptr(), w, h) }, "widget_resize")
    }

    fn clicked(&self, filename: &str, event: &str, timestamp: f64, x: f64, y: f64) -> Result<()> {
        let Some(f) = self.clicked else { return Err(WidgetError::NotSupported("clicked".into())) };
        let (filename, event) = (cstr(filename)?, cstr(event)?);
        status(unsafe { f(self.pid(), filename.as_ptr(), event.as_ptr(), timestamp, x, y) }, "widget_clicked")
    }

    fn text_signal(&self, filename: &str, signal: &str, source: &str) -> Result<()> {
        let Some(f) = self.text_signal else { return Err(WidgetError::NotSupported("text_signal".into())) };
        let (filename, signal, source) = (cstr(filename)?, cstr(signal)?, cstr(source)?);
        status(unsafe { f(self.pid(), filename.as_ptr(), signal.as_ptr(), source.as_ptr()) }, "widget_text_signal")
    }

    fn create_needed(&self, cluster: &str, category: &str) -> Result<bool> {
        let Some(f) = self.create_needed else { return Ok(true) };
        let (cluster, category) = (cstr(cluster)?, cstr(category)?);
        let mut out: c_int = 1;
        let code = unsafe { f(self.pid(), cluster.as_ptr(), category.as_ptr(), &mut out) };
        status(code, "widget_create_needed")?;
        Ok(out != 0)
    }

    fn change_group(&self, filename: &str, cluster: &str, category: &str) -> Result<()> {
        let Some(f) = self.change_group else { return Err(WidgetError::NotSupported("change_group".into())) };
        let (filename, cluster, category) = (cstr(filename)?, cstr(cluster)?, cstr(category)?);
        status(unsafe { f(self.pid(), filename.as_ptr(), cluster.as_ptr(), category.as_ptr()) }, "widget_change_group")
    }

    fn get_output_info(&self, filename: &str) -> Result<OutputInfo> {
        let Some(f) = self.get_output_info else { return Err(WidgetError::NotSupported("get_output_info".into())) };
        let filename = cstr(filename)?;
        let (mut width, mut height, mut priority) = (0i32, 0i32, 0f64);
        let mut content_buf = [0u8; TEXT_BUF_CAP];
        let mut title_buf = [0u8; TEXT_BUF_CAP];
        let code = unsafe {
            f(
                self.pid(),
                filename.as_ptr(),
                &mut width,
                &mut height,
                &mut priority,
                content_buf.as_mut_ptr() as *mut c_char,
                content_buf.len(),
                title_buf.as_mut_ptr() as *mut c_char,
                title_buf.len(),
            )
        };
        status(code, "widget_get_output_info")?;
        Ok(OutputInfo { width, height, priority, content: buf_to_string(&content_buf), title: buf_to_string(&title_buf) })
    }

    fn get_alt_info(&self, filename: &str) -> Result<AltInfo> {
        let Some(f) = self.get_alt_info else { return Err(WidgetError::NotSupported("get_alt_info".into())) };
        let filename = cstr(filename)?;
        let mut icon_buf = [0u8; TEXT_BUF_CAP];
        let mut name_buf = [0u8; TEXT_BUF_CAP];
        let code = unsafe {
            f(
                self.pid(),
                filename.as_ptr(),
                icon_buf.as_mut_ptr() as *mut c_char,
                icon_buf.len(),
                name_buf.as_mut_ptr() as *mut c_char,
                name_buf.len(),
            )
        };
        status(code, "widget_get_alt_info")?;
        Ok(AltInfo { icon: buf_to_string(&icon_buf), name: buf_to_string(&name_buf) })
    }

    fn pinup(&self, filename: &str, pin: bool) -> Result<String> {
        let Some(f) = self.pinup else { return Err(WidgetError::NotSupported("pinup".into())) };
        let filename = cstr(filename)?;
        let mut uri_buf = [0u8; URI_BUF_CAP];
        let code = unsafe { f(self.pid(), filename.as_ptr(), pin as c_int, uri_buf.as_mut_ptr() as *mut c_char, uri_buf.len()) };
        status(code, "widget_pinup")?;
        Ok(buf_to_string(&uri_buf).unwrap_or_default())
    }

    fn is_pinned_up(&self, filename: &str) -> Result<bool> {
        let Some(f) = self.is_pinned_up else { return Ok(false) };
        let filename = cstr(filename)?;
        let mut out: c_int = 0;
        let code = unsafe { f(self.pid(), filename.as_ptr(), &mut out) };
        status(code, "widget_is_pinned_up")?;
        Ok(out != 0)
    }

    fn system_event(&self, filename: &str, event: SystemEvent) -> Result<()> {
        let Some(f) = self.system_event else { return Err(WidgetError::NotSupported("system_event".into())) };
        let filename = cstr(filename)?;
        status(unsafe { f(self.pid(), filename.as_ptr(), system_event_code(event)) }, "widget_system_event")
    }

    fn set_content_info(&self, filename: &str, content: &str) -> Result<()> {
        let Some(f) = self.set_content_info else { return Err(WidgetError::NotSupported("set_content_info".into())) };
        let (filename, content) = (cstr(filename)?, cstr(content)?);
        status(unsafe { f(self.pid(), filename.as_ptr(), content.as_ptr()) }, "widget_set_content_info")
    }

    fn initialize(&self, package_id: &str) -> Result<()> {
        let Some(f) = self.initialize else { return Ok(()) };
        let package_id = cstr(package_id)?;
        status(unsafe { f(package_id.as_ptr()) }, "widget_initialize")
    }

    fn finalize(&self) -> Result<()> {
        let Some(f) = self.finalize else { return Ok(()) };
        status(unsafe { f(self.pid()) }, "widget_finalize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_missing_shared_object_is_a_fault() {
        let err = NativeModule::open(Path::new("/nonexistent/path/does-not-exist.so")).unwrap_err();
        assert!(matches!(err, WidgetError::Fault(_)));
    }

    #[test]
    fn buf_to_string_stops_at_first_nul_and_rejects_empty() {
        let mut buf = [0u8; 16];
        buf[..5].copy_from_slice(b"hello");
        assert_eq!(buf_to_string(&buf).as_deref(), Some("hello"));
        assert_eq!(buf_to_string(&[0u8; 4]), None);
    }
}
