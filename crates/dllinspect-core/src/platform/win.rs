//! DAC-based adapter for .NET Framework and .NET (Core) processes on Windows.
//!
//! The target is opened with `PROCESS_QUERY_INFORMATION | PROCESS_VM_READ`
//! only. All runtime state is read through the runtime's own DAC, loaded
//! into this process and pointed at the target via our `ICLRDataTarget`.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use windows::Win32::Foundation::{CloseHandle, FreeLibrary, HANDLE, HMODULE};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetModuleBaseNameW, GetModuleFileNameExW, LIST_MODULES_ALL,
};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};
use windows::core::PCWSTR;

use super::dac::{
    CLRDataCreateInstanceFn, CLRDataTarget, ClrDataAddress, DacpAppDomainData,
    DacpAppDomainStoreData, DacpAssemblyData, DacpModuleData, IID_ISOS_DAC_INTERFACE,
    ISOSDacInterface, ModuleBases,
};
use crate::metadata::{
    ImageLayout, mapped_to_file_layout, read_assembly_identity, read_assembly_identity_from_file,
    read_pe_info,
};
use crate::{
    DiagnosticTarget, Error, ExecutionContext, ModuleStream, RawModuleRecord, Result,
    RuntimeDescriptor, RuntimeKind, RuntimeSession, RuntimeSource,
};

const PAGE_SIZE: usize = 0x1000;

/// Images larger than this are not read from memory.
const MAX_IMAGE_SIZE: usize = 512 * 1024 * 1024;

// =============================================================================
// Process Handle RAII Wrapper
// =============================================================================

/// Read-only process handle, closed on drop.
struct ProcessHandle(HANDLE);

impl ProcessHandle {
    fn open(pid: u32) -> Result<Self> {
        let handle =
            unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }
                .map_err(|e| Error::attach(pid, e))?;
        Ok(Self(handle))
    }

    fn as_raw(&self) -> HANDLE {
        self.0
    }

    /// Read `buffer.len()` bytes at `address`, failing on a short read.
    fn read_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let read = read_memory(self.0, address, buffer)?;
        if read != buffer.len() {
            return Err(Error::RecordRead(format!(
                "short read at 0x{:X}: {} of {} bytes",
                address,
                read,
                buffer.len()
            )));
        }
        Ok(())
    }
}

/// Read up to `buffer.len()` bytes of the target's memory at `address`.
pub(super) fn read_memory(handle: HANDLE, address: u64, buffer: &mut [u8]) -> Result<usize> {
    let mut read = 0usize;
    unsafe {
        ReadProcessMemory(
            handle,
            address as usize as *const c_void,
            buffer.as_mut_ptr() as *mut c_void,
            buffer.len(),
            Some(&mut read),
        )
    }?;
    Ok(read)
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0).ok() };
    }
}

// =============================================================================
// Source / Target
// =============================================================================

/// A native module loaded in the target.
#[derive(Debug, Clone)]
struct NativeModule {
    name: String,
    path: PathBuf,
    base: u64,
}

fn enumerate_native_modules(handle: HANDLE) -> Result<Vec<NativeModule>> {
    let mut modules = [HMODULE::default(); 1024];
    let mut needed = 0u32;

    unsafe {
        EnumProcessModulesEx(
            handle,
            modules.as_mut_ptr(),
            std::mem::size_of_val(&modules) as u32,
            &mut needed,
            LIST_MODULES_ALL,
        )
    }?;

    let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(modules.len());
    let mut result = Vec::with_capacity(count);

    for &module in &modules[..count] {
        let mut name_buf = [0u16; 260];
        let len = unsafe { GetModuleBaseNameW(handle, Some(module), &mut name_buf) };
        if len == 0 {
            continue;
        }
        let mut path_buf = [0u16; 1024];
        let path_len = unsafe { GetModuleFileNameExW(Some(handle), Some(module), &mut path_buf) };

        result.push(NativeModule {
            name: String::from_utf16_lossy(&name_buf[..len as usize]),
            path: PathBuf::from(String::from_utf16_lossy(&path_buf[..path_len as usize])),
            base: module.0 as u64,
        });
    }

    Ok(result)
}

/// Attaches through `OpenProcess` and the runtime's DAC.
#[derive(Debug, Clone, Copy, Default)]
pub struct DacSource;

impl RuntimeSource for DacSource {
    type Target = DacTarget;

    fn attach(&self, pid: u32) -> Result<DacTarget> {
        let handle = ProcessHandle::open(pid)?;
        // Fails with a partial-copy error for a bitness mismatch.
        let modules = enumerate_native_modules(handle.as_raw()).map_err(|e| Error::attach(pid, e))?;
        tracing::debug!(pid, modules = modules.len(), "Opened process");
        Ok(DacTarget {
            pid,
            handle,
            modules,
        })
    }
}

/// An open, read-only handle on a Windows process.
pub struct DacTarget {
    pid: u32,
    handle: ProcessHandle,
    modules: Vec<NativeModule>,
}

impl DacTarget {
    fn module_bases(&self) -> ModuleBases {
        self.modules.iter().map(|m| (m.name.as_str(), m.base)).collect()
    }
}

impl DiagnosticTarget for DacTarget {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn runtimes(&self) -> Result<Vec<RuntimeDescriptor>> {
        let mut runtimes: Vec<RuntimeDescriptor> = Vec::new();
        for module in &self.modules {
            let Some(kind) = RuntimeKind::from_module_name(&module.name) else {
                continue;
            };
            let runtime = RuntimeDescriptor::from_module_path(kind, &module.path);
            if !runtimes.contains(&runtime) {
                runtimes.push(runtime);
            }
        }
        Ok(runtimes)
    }

    fn open_runtime(&self, runtime: &RuntimeDescriptor) -> Result<Box<dyn RuntimeSession + '_>> {
        let dac_path = runtime.dac_path();
        if !dac_path.exists() {
            return Err(Error::attach(
                self.pid,
                format!("{} not found at {}", runtime.kind.dac_dll_name(), dac_path.display()),
            ));
        }

        let library = DacLibrary::load(&dac_path).map_err(|e| Error::attach(self.pid, e))?;
        let create_instance = library.create_instance().map_err(|e| Error::attach(self.pid, e))?;

        let data_target = CLRDataTarget::create(self.handle.as_raw(), self.module_bases());
        let mut sos: *mut c_void = std::ptr::null_mut();
        let hr = unsafe { create_instance(&IID_ISOS_DAC_INTERFACE, data_target as *mut c_void, &mut sos) };
        // The DAC holds its own reference when it succeeded.
        unsafe { CLRDataTarget::release(data_target) };

        if hr.is_err() || sos.is_null() {
            return Err(Error::attach(
                self.pid,
                format!("CLRDataCreateInstance failed: 0x{:08X}", hr.0 as u32),
            ));
        }

        tracing::debug!(pid = self.pid, dac = %dac_path.display(), "Created SOS DAC interface");
        Ok(Box::new(DacSession {
            target: self,
            sos: SosDac(sos as *mut ISOSDacInterface),
            _library: library,
        }))
    }
}

// =============================================================================
// DAC library and interface guards
// =============================================================================

/// A loaded DAC DLL, freed on drop.
struct DacLibrary(HMODULE);

impl DacLibrary {
    fn load(path: &Path) -> Result<Self> {
        let wide: Vec<u16> = path
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let module = unsafe { LoadLibraryW(PCWSTR::from_raw(wide.as_ptr())) }?;
        Ok(Self(module))
    }

    fn create_instance(&self) -> Result<CLRDataCreateInstanceFn> {
        let proc = unsafe { GetProcAddress(self.0, windows::core::s!("CLRDataCreateInstance")) };
        match proc {
            Some(p) => Ok(unsafe { std::mem::transmute::<_, CLRDataCreateInstanceFn>(p) }),
            None => Err(Error::EnumerationFailed("CLRDataCreateInstance not exported".into())),
        }
    }
}

impl Drop for DacLibrary {
    fn drop(&mut self) {
        unsafe { FreeLibrary(self.0).ok() };
    }
}

/// Owned `ISOSDacInterface` reference.
struct SosDac(*mut ISOSDacInterface);

impl SosDac {
    fn vtbl(&self) -> &super::dac::ISOSDacInterfaceVtbl {
        unsafe { &*(*self.0).vtbl }
    }

    fn app_domain_store(&self) -> Result<DacpAppDomainStoreData> {
        let mut data = DacpAppDomainStoreData::default();
        let hr = unsafe { (self.vtbl().get_app_domain_store_data)(self.0, &mut data) };
        hr.ok()?;
        Ok(data)
    }

    fn app_domain_list(&self, count: usize) -> Result<Vec<ClrDataAddress>> {
        let mut domains = vec![0 as ClrDataAddress; count];
        let mut fetched = 0u32;
        let hr = unsafe {
            (self.vtbl().get_app_domain_list)(self.0, count as u32, domains.as_mut_ptr(), &mut fetched)
        };
        hr.ok()?;
        domains.truncate(fetched as usize);
        Ok(domains)
    }

    fn app_domain_data(&self, domain: ClrDataAddress) -> Result<DacpAppDomainData> {
        let mut data = DacpAppDomainData::default();
        let hr = unsafe { (self.vtbl().get_app_domain_data)(self.0, domain, &mut data) };
        hr.ok()?;
        Ok(data)
    }

    fn app_domain_name(&self, domain: ClrDataAddress) -> Option<String> {
        let mut buf = [0u16; 512];
        let mut needed = 0u32;
        let hr = unsafe {
            (self.vtbl().get_app_domain_name)(self.0, domain, buf.len() as u32, buf.as_mut_ptr(), &mut needed)
        };
        if hr.is_err() {
            return None;
        }
        Some(wide_to_string(&buf, needed)).filter(|s| !s.is_empty())
    }

    fn assembly_list(&self, domain: ClrDataAddress, count: usize) -> Result<Vec<ClrDataAddress>> {
        let mut assemblies = vec![0 as ClrDataAddress; count];
        let mut fetched = 0i32;
        let hr = unsafe {
            (self.vtbl().get_assembly_list)(
                self.0,
                domain,
                count as i32,
                assemblies.as_mut_ptr(),
                &mut fetched,
            )
        };
        hr.ok()?;
        assemblies.truncate(fetched.max(0) as usize);
        Ok(assemblies)
    }

    fn assembly_data(&self, domain: ClrDataAddress, assembly: ClrDataAddress) -> Result<DacpAssemblyData> {
        let mut data = DacpAssemblyData::default();
        let hr = unsafe { (self.vtbl().get_assembly_data)(self.0, domain, assembly, &mut data) };
        hr.ok()?;
        Ok(data)
    }

    fn assembly_name(&self, assembly: ClrDataAddress) -> Option<String> {
        let mut buf = [0u16; 1024];
        let mut needed = 0u32;
        let hr = unsafe {
            (self.vtbl().get_assembly_name)(self.0, assembly, buf.len() as u32, buf.as_mut_ptr(), &mut needed)
        };
        if hr.is_err() {
            return None;
        }
        Some(wide_to_string(&buf, needed)).filter(|s| !s.is_empty())
    }

    fn manifest_module(&self, assembly: ClrDataAddress) -> Result<ClrDataAddress> {
        let mut modules = [0 as ClrDataAddress; 1];
        let mut fetched = 0u32;
        let hr = unsafe {
            (self.vtbl().get_assembly_module_list)(self.0, assembly, 1, modules.as_mut_ptr(), &mut fetched)
        };
        hr.ok()?;
        if fetched == 0 || modules[0] == 0 {
            return Err(Error::RecordRead(format!("assembly 0x{:X} has no modules", assembly)));
        }
        Ok(modules[0])
    }

    fn module_data(&self, module: ClrDataAddress) -> Result<DacpModuleData> {
        let mut data = DacpModuleData::default();
        let hr = unsafe { (self.vtbl().get_module_data)(self.0, module, &mut data) };
        hr.ok()?;
        Ok(data)
    }
}

impl Drop for SosDac {
    fn drop(&mut self) {
        unsafe { (self.vtbl().release)(self.0) };
    }
}

fn wide_to_string(buf: &[u16], needed: u32) -> String {
    let len = (needed as usize).min(buf.len());
    let end = buf[..len].iter().position(|&c| c == 0).unwrap_or(len);
    String::from_utf16_lossy(&buf[..end])
}

// =============================================================================
// Session
// =============================================================================

struct DacSession<'a> {
    target: &'a DacTarget,
    // Declared before the library so the interface is released first.
    sos: SosDac,
    _library: DacLibrary,
}

impl DacSession<'_> {
    /// Build one record from an assembly address in `domain`.
    fn read_record(&self, domain: ClrDataAddress, assembly: ClrDataAddress) -> Result<RawModuleRecord> {
        let data = self
            .sos
            .assembly_data(domain, assembly)
            .map_err(|e| Error::RecordRead(format!("assembly 0x{:X}: {}", assembly, e)))?;
        let module = self.sos.manifest_module(assembly)?;
        let module_data = self
            .sos
            .module_data(module)
            .map_err(|e| Error::RecordRead(format!("module 0x{:X}: {}", module, e)))?;

        // GetAssemblyName reports the load path; empty for byte-array and dynamic loads.
        let file_path = self
            .sos
            .assembly_name(assembly)
            .filter(|name| name.contains('\\') || name.contains('/'));

        let identity = match &file_path {
            Some(path) if Path::new(path).is_file() => read_assembly_identity_from_file(Path::new(path)),
            _ if module_data.ilBase != 0 => self.identity_from_memory(module_data.ilBase),
            _ => Err(Error::RecordRead(format!(
                "assembly 0x{:X} has no image (dynamic: {})",
                assembly,
                data.isDynamic != 0
            ))),
        }?;

        Ok(RawModuleRecord {
            identity: Some(identity.to_string()),
            base_address: module_data.ilBase,
            file_path,
        })
    }

    fn identity_from_memory(&self, base: u64) -> Result<crate::metadata::AssemblyIdentity> {
        let image = self.read_image(base)?;
        // Loader-mapped images first; byte-array loads keep the file layout.
        let file = mapped_to_file_layout(&image)?;
        read_assembly_identity(&file, ImageLayout::File)
            .or_else(|_| read_assembly_identity(&image, ImageLayout::File))
    }

    fn read_image(&self, base: u64) -> Result<Vec<u8>> {
        let mut headers = vec![0u8; PAGE_SIZE];
        self.target.handle.read_exact(base, &mut headers)?;
        let size = read_pe_info(&headers)?.size_of_image as usize;
        if size == 0 || size > MAX_IMAGE_SIZE {
            return Err(Error::Metadata(format!("implausible image size 0x{:X}", size)));
        }

        // Page by page; gaps (guard pages, unmapped tails) stay zeroed.
        let mut image = vec![0u8; size];
        for (index, page) in image.chunks_mut(PAGE_SIZE).enumerate() {
            let address = base + (index * PAGE_SIZE) as u64;
            if self.target.handle.read_exact(address, page).is_err() {
                tracing::trace!(address, "Unreadable image page");
            }
        }
        Ok(image)
    }
}

impl RuntimeSession for DacSession<'_> {
    fn contexts(&self) -> Result<Vec<ExecutionContext>> {
        let store = self
            .sos
            .app_domain_store()
            .map_err(|e| Error::EnumerationFailed(format!("GetAppDomainStoreData: {}", e)))?;

        let mut contexts = Vec::new();
        if store.systemDomain != 0 {
            contexts.push(ExecutionContext {
                id: store.systemDomain,
                name: "System Domain".to_string(),
            });
        }
        if store.sharedDomain != 0 {
            contexts.push(ExecutionContext {
                id: store.sharedDomain,
                name: "Shared Domain".to_string(),
            });
        }

        let count = store.DomainCount.max(0) as usize;
        if count > 0 {
            let domains = self
                .sos
                .app_domain_list(count)
                .map_err(|e| Error::EnumerationFailed(format!("GetAppDomainList: {}", e)))?;
            for domain in domains.into_iter().filter(|&d| d != 0) {
                let name = self
                    .sos
                    .app_domain_name(domain)
                    .unwrap_or_else(|| format!("AppDomain 0x{:X}", domain));
                contexts.push(ExecutionContext { id: domain, name });
            }
        }

        tracing::debug!(count = contexts.len(), "Found execution contexts");
        Ok(contexts)
    }

    fn modules(&self, context: &ExecutionContext) -> ModuleStream<'_> {
        let domain = context.id;
        let assemblies = self
            .sos
            .app_domain_data(domain)
            .and_then(|data| self.sos.assembly_list(domain, data.AssemblyCount.max(0) as usize));

        match assemblies {
            Ok(assemblies) => Box::new(
                assemblies
                    .into_iter()
                    .filter(|&a| a != 0)
                    .map(move |assembly| self.read_record(domain, assembly)),
            ),
            Err(e) => {
                // One unreadable domain must not hide the others.
                tracing::warn!(context = %context.name, error = %e, "Failed to list assemblies");
                Box::new(std::iter::empty())
            }
        }
    }
}
