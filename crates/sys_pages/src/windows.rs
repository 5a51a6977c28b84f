use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    pub fn reserve(len: usize) -> io::Result<Self> {
        // Windows requires MEM_RESERVE | MEM_COMMIT to get usable memory.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let rc = unsafe {
            VirtualFree(
                self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>(),
                len,
                MEM_DECOMMIT,
            )
        };
        if rc == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let ptr = unsafe {
            VirtualAlloc(
                self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>(),
                len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0.
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
