//! DAC (Data Access Component) interface definitions and our `ICLRDataTarget`.
//!
//! The DAC is the runtime's own out-of-process inspection library. We hand
//! it an `ICLRDataTarget` backed by `ReadProcessMemory` and query it through
//! the prefix of `ISOSDacInterface` we need.

#![allow(non_snake_case)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use windows::Win32::Foundation::{E_FAIL, E_NOINTERFACE, E_NOTIMPL, HANDLE, S_OK};
use windows::core::{GUID, HRESULT};

use super::win::read_memory;

/// Type alias for CLR data addresses
pub type ClrDataAddress = u64;

// Machine type constant for current architecture
#[cfg(target_arch = "x86_64")]
const IMAGE_FILE_MACHINE_CURRENT: u16 = 0x8664; // AMD64
#[cfg(target_arch = "x86")]
const IMAGE_FILE_MACHINE_CURRENT: u16 = 0x014c; // I386
#[cfg(target_arch = "aarch64")]
const IMAGE_FILE_MACHINE_CURRENT: u16 = 0xAA64; // ARM64

// GUID for ICLRDataTarget interface
const IID_ICLR_DATA_TARGET: GUID = GUID::from_u128(0x3E11CCEE_D08B_43E5_AF01_32717A64DA03);
const IID_IUNKNOWN: GUID = GUID::from_u128(0x00000000_0000_0000_C000_000000000046);

/// GUID for ISOSDacInterface, accepted directly by CLRDataCreateInstance.
pub const IID_ISOS_DAC_INTERFACE: GUID = GUID::from_u128(0x436F00F2_B42A_4B9F_870C_E73DB66AE930);

/// CLRDataCreateInstance function type (exported by DAC DLLs)
pub type CLRDataCreateInstanceFn = unsafe extern "system" fn(
    riid: *const GUID,
    data_target: *mut c_void,
    ppv_object: *mut *mut c_void,
) -> HRESULT;

// =============================================================================
// DAC data structures (dacprivate.h)
// =============================================================================

#[repr(C)]
#[derive(Debug, Default)]
pub struct DacpAppDomainStoreData {
    pub sharedDomain: ClrDataAddress,
    pub systemDomain: ClrDataAddress,
    pub DomainCount: i32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DacpAppDomainData {
    pub AppDomainPtr: ClrDataAddress,
    pub AppSecDesc: ClrDataAddress,
    pub pLowFrequencyHeap: ClrDataAddress,
    pub pHighFrequencyHeap: ClrDataAddress,
    pub pStubHeap: ClrDataAddress,
    pub DomainLocalBlock: ClrDataAddress,
    pub pDomainLocalModules: ClrDataAddress,
    pub dwId: u32,
    pub AssemblyCount: i32,
    pub FailedAssemblyCount: i32,
    pub appDomainStage: i32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DacpAssemblyData {
    pub AssemblyPtr: ClrDataAddress,
    pub ClassLoader: ClrDataAddress,
    pub ParentDomain: ClrDataAddress,
    pub BaseDomainPtr: ClrDataAddress,
    pub AssemblySecDesc: ClrDataAddress,
    pub isDynamic: i32,
    pub ModuleCount: u32,
    pub LoadContext: u32,
    pub isDomainNeutral: i32,
    pub dwLocationFlags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DacpModuleData {
    pub Address: ClrDataAddress,
    pub PEAssembly: ClrDataAddress,
    pub ilBase: ClrDataAddress,
    pub metadataStart: ClrDataAddress,
    pub metadataSize: u64,
    pub Assembly: ClrDataAddress,
    pub bIsReflection: i32,
    pub bIsPEFile: i32,
    pub dwBaseClassIndex: u64,
    pub dwModuleID: u64,
    pub dwTransientFlags: u32,
    pub TypeDefToMethodTableMap: ClrDataAddress,
    pub TypeRefToMethodTableMap: ClrDataAddress,
    pub MethodDefToDescMap: ClrDataAddress,
    pub FieldDefToDescMap: ClrDataAddress,
    pub MemberRefToDescMap: ClrDataAddress,
    pub FileReferencesMap: ClrDataAddress,
    pub ManifestModuleReferencesMap: ClrDataAddress,
    pub LoaderAllocator: ClrDataAddress,
    pub ThunkHeap: ClrDataAddress,
    pub dwModuleIndex: u64,
}

// =============================================================================
// ISOSDacInterface - the vtable prefix we call into
// =============================================================================

#[repr(C)]
pub struct ISOSDacInterfaceVtbl {
    // IUnknown
    pub query_interface:
        unsafe extern "system" fn(*mut ISOSDacInterface, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut ISOSDacInterface) -> u32,
    pub release: unsafe extern "system" fn(*mut ISOSDacInterface) -> u32,
    // ISOSDacInterface
    pub get_thread_store_data: usize,
    pub get_app_domain_store_data:
        unsafe extern "system" fn(*mut ISOSDacInterface, *mut DacpAppDomainStoreData) -> HRESULT,
    pub get_app_domain_list: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        u32,
        *mut ClrDataAddress,
        *mut u32,
    ) -> HRESULT,
    pub get_app_domain_data: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        *mut DacpAppDomainData,
    ) -> HRESULT,
    pub get_app_domain_name: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        u32,
        *mut u16,
        *mut u32,
    ) -> HRESULT,
    pub get_domain_from_context: usize,
    pub get_assembly_list: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        i32,
        *mut ClrDataAddress,
        *mut i32,
    ) -> HRESULT,
    pub get_assembly_data: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        ClrDataAddress,
        *mut DacpAssemblyData,
    ) -> HRESULT,
    pub get_assembly_name: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        u32,
        *mut u16,
        *mut u32,
    ) -> HRESULT,
    pub get_module: usize,
    pub get_module_data: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        *mut DacpModuleData,
    ) -> HRESULT,
    pub traverse_module_map: usize,
    pub get_assembly_module_list: unsafe extern "system" fn(
        *mut ISOSDacInterface,
        ClrDataAddress,
        u32,
        *mut ClrDataAddress,
        *mut u32,
    ) -> HRESULT,
}

#[repr(C)]
pub struct ISOSDacInterface {
    pub vtbl: *const ISOSDacInterfaceVtbl,
}

// =============================================================================
// ICLRDataTarget vtable and implementation struct
// =============================================================================

#[repr(C)]
struct ICLRDataTargetVtbl {
    // IUnknown
    query_interface: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        *const GUID,
        *mut *mut c_void,
    ) -> HRESULT,
    add_ref: unsafe extern "system" fn(*mut ICLRDataTargetImpl) -> u32,
    release: unsafe extern "system" fn(*mut ICLRDataTargetImpl) -> u32,
    // ICLRDataTarget
    get_machine_type: unsafe extern "system" fn(*mut ICLRDataTargetImpl, *mut u32) -> HRESULT,
    get_pointer_size: unsafe extern "system" fn(*mut ICLRDataTargetImpl, *mut u32) -> HRESULT,
    get_image_base: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        *const u16,
        *mut ClrDataAddress,
    ) -> HRESULT,
    read_virtual: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        ClrDataAddress,
        *mut u8,
        u32,
        *mut u32,
    ) -> HRESULT,
    write_virtual: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        ClrDataAddress,
        *mut u8,
        u32,
        *mut u32,
    ) -> HRESULT,
    get_tls_value: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        u32,
        u32,
        *mut ClrDataAddress,
    ) -> HRESULT,
    set_tls_value:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, ClrDataAddress) -> HRESULT,
    get_current_thread_id: unsafe extern "system" fn(*mut ICLRDataTargetImpl, *mut u32) -> HRESULT,
    get_thread_context:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, u32, *mut u8) -> HRESULT,
    set_thread_context:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, *mut u8) -> HRESULT,
    request: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        u32,
        u32,
        *mut u8,
        u32,
        *mut u8,
    ) -> HRESULT,
}

#[repr(C)]
pub struct ICLRDataTargetImpl {
    vtbl: *const ICLRDataTargetVtbl,
}

/// Native module bases keyed by lowercase file name.
///
/// The DAC asks for images by full path, in whatever form the runtime
/// recorded them, so only the file name is compared.
#[derive(Debug, Default, Clone)]
pub struct ModuleBases(HashMap<String, u64>);

fn module_key(path: &str) -> String {
    path.rsplit(['\\', '/']).next().unwrap_or(path).to_lowercase()
}

impl ModuleBases {
    pub fn lookup(&self, image_path: &str) -> Option<u64> {
        self.0.get(&module_key(image_path)).copied()
    }
}

impl<S: AsRef<str>> FromIterator<(S, u64)> for ModuleBases {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(name, base)| (module_key(name.as_ref()), base)).collect())
    }
}

/// Read-only ICLRDataTarget over a process handle owned elsewhere.
///
/// Writes, thread contexts and TLS are refused, so the DAC can never alter
/// the target.
#[repr(C)]
pub struct CLRDataTarget {
    vtbl: *const ICLRDataTargetVtbl,
    ref_count: AtomicU32,
    process_handle: HANDLE,
    module_bases: ModuleBases,
}

static CLR_DATA_TARGET_VTBL: ICLRDataTargetVtbl = ICLRDataTargetVtbl {
    query_interface: clr_query_interface,
    add_ref: clr_add_ref,
    release: clr_release,
    get_machine_type: clr_get_machine_type,
    get_pointer_size: clr_get_pointer_size,
    get_image_base: clr_get_image_base,
    read_virtual: clr_read_virtual,
    write_virtual: clr_write_virtual,
    get_tls_value: clr_get_tls_value,
    set_tls_value: clr_set_tls_value,
    get_current_thread_id: clr_get_current_thread_id,
    get_thread_context: clr_get_thread_context,
    set_thread_context: clr_set_thread_context,
    request: clr_request,
};

impl CLRDataTarget {
    /// Allocate a data target with one reference held by the caller.
    ///
    /// The handle must stay open until the last reference is released.
    pub fn create(process_handle: HANDLE, module_bases: ModuleBases) -> *mut ICLRDataTargetImpl {
        let target = Box::new(CLRDataTarget {
            vtbl: &CLR_DATA_TARGET_VTBL,
            ref_count: AtomicU32::new(1),
            process_handle,
            module_bases,
        });
        Box::into_raw(target) as *mut ICLRDataTargetImpl
    }

    /// Drop one reference taken by [`CLRDataTarget::create`].
    ///
    /// # Safety
    /// `this` must come from `create` and still hold a reference.
    pub unsafe fn release(this: *mut ICLRDataTargetImpl) -> u32 {
        unsafe { clr_release(this) }
    }

    /// # Safety
    /// `this` must be a live pointer returned by [`CLRDataTarget::create`].
    unsafe fn from_raw<'a>(this: *mut ICLRDataTargetImpl) -> &'a CLRDataTarget {
        unsafe { &*(this as *const CLRDataTarget) }
    }
}

/// Copy a NUL-terminated UTF-16 string.
///
/// # Safety
/// `ptr` must point at a NUL-terminated wide string.
unsafe fn wide_cstr(ptr: *const u16) -> String {
    let mut len = 0;
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    String::from_utf16_lossy(unsafe { std::slice::from_raw_parts(ptr, len) })
}

// IUnknown implementation
unsafe extern "system" fn clr_query_interface(
    this: *mut ICLRDataTargetImpl,
    riid: *const GUID,
    ppv_object: *mut *mut c_void,
) -> HRESULT {
    if ppv_object.is_null() || riid.is_null() {
        return E_FAIL;
    }

    let riid = unsafe { &*riid };
    if *riid == IID_IUNKNOWN || *riid == IID_ICLR_DATA_TARGET {
        unsafe {
            *ppv_object = this as *mut c_void;
            clr_add_ref(this);
        }
        return S_OK;
    }

    unsafe { *ppv_object = std::ptr::null_mut() };
    E_NOINTERFACE
}

unsafe extern "system" fn clr_add_ref(this: *mut ICLRDataTargetImpl) -> u32 {
    let target = unsafe { CLRDataTarget::from_raw(this) };
    target.ref_count.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn clr_release(this: *mut ICLRDataTargetImpl) -> u32 {
    let target = unsafe { CLRDataTarget::from_raw(this) };
    let count = target.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
    if count == 0 {
        drop(unsafe { Box::from_raw(this as *mut CLRDataTarget) });
    }
    count
}

unsafe extern "system" fn clr_get_machine_type(
    _this: *mut ICLRDataTargetImpl,
    machine_type: *mut u32,
) -> HRESULT {
    if machine_type.is_null() {
        return E_FAIL;
    }
    unsafe { *machine_type = IMAGE_FILE_MACHINE_CURRENT as u32 };
    S_OK
}

unsafe extern "system" fn clr_get_pointer_size(
    _this: *mut ICLRDataTargetImpl,
    pointer_size: *mut u32,
) -> HRESULT {
    if pointer_size.is_null() {
        return E_FAIL;
    }
    unsafe { *pointer_size = std::mem::size_of::<*const c_void>() as u32 };
    S_OK
}

unsafe extern "system" fn clr_get_image_base(
    this: *mut ICLRDataTargetImpl,
    image_path: *const u16,
    base_address: *mut ClrDataAddress,
) -> HRESULT {
    if image_path.is_null() || base_address.is_null() {
        return E_FAIL;
    }

    let target = unsafe { CLRDataTarget::from_raw(this) };
    let path = unsafe { wide_cstr(image_path) };
    match target.module_bases.lookup(&path) {
        Some(base) => {
            unsafe { *base_address = base };
            S_OK
        }
        None => {
            tracing::trace!(%path, "DAC asked for an image that is not loaded");
            E_FAIL
        }
    }
}

unsafe extern "system" fn clr_read_virtual(
    this: *mut ICLRDataTargetImpl,
    address: ClrDataAddress,
    buffer: *mut u8,
    bytes_requested: u32,
    bytes_read: *mut u32,
) -> HRESULT {
    if buffer.is_null() {
        return E_FAIL;
    }

    let target = unsafe { CLRDataTarget::from_raw(this) };
    let buffer = unsafe { std::slice::from_raw_parts_mut(buffer, bytes_requested as usize) };
    match read_memory(target.process_handle, address, buffer) {
        Ok(read) => {
            if !bytes_read.is_null() {
                unsafe { *bytes_read = read as u32 };
            }
            S_OK
        }
        Err(_) => E_FAIL,
    }
}

// Not implemented methods
unsafe extern "system" fn clr_write_virtual(
    _this: *mut ICLRDataTargetImpl,
    _address: ClrDataAddress,
    _buffer: *mut u8,
    _bytes_requested: u32,
    _bytes_written: *mut u32,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn clr_get_tls_value(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _index: u32,
    _value: *mut ClrDataAddress,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn clr_set_tls_value(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _index: u32,
    _value: ClrDataAddress,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn clr_get_current_thread_id(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: *mut u32,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn clr_get_thread_context(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _context_flags: u32,
    _context_size: u32,
    _context: *mut u8,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn clr_set_thread_context(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _context_size: u32,
    _context: *mut u8,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn clr_request(
    _this: *mut ICLRDataTargetImpl,
    _req_code: u32,
    _in_buffer_size: u32,
    _in_buffer: *mut u8,
    _out_buffer_size: u32,
    _out_buffer: *mut u8,
) -> HRESULT {
    E_NOTIMPL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_base_matches_file_name_in_any_case() {
        let bases: ModuleBases = [("coreclr.dll", 0x7FF8_0000_0000u64), ("clr.dll", 0x7FF9_0000_0000u64)]
            .into_iter()
            .collect();

        assert_eq!(
            bases.lookup(r"C:\Program Files\dotnet\shared\Microsoft.NETCore.App\8.0.11\CoreCLR.dll"),
            Some(0x7FF8_0000_0000)
        );
        assert_eq!(
            bases.lookup(r"C:\Windows\Microsoft.NET\Framework64\v4.0.30319\clr.dll"),
            Some(0x7FF9_0000_0000)
        );
        assert_eq!(bases.lookup("clr.dll"), Some(0x7FF9_0000_0000));
        assert_eq!(bases.lookup(r"C:\Windows\System32\kernel32.dll"), None);
    }

    #[test]
    fn mixed_separators_use_last_component() {
        assert_eq!(module_key(r"C:/dotnet\shared/CoreCLR.DLL"), "coreclr.dll");
        assert_eq!(module_key("coreclr.dll"), "coreclr.dll");
    }
}
