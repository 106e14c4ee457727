// Presentation surface
//
// Bridges the windowing layer's raw handles to a VkSurfaceKHR. Only the
// handle kinds we can build without extra platform crates are accepted.

use super::error::{RenderError, RenderResult, VkResultExt};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

/// Raw handles handed over by the windowing collaborator.
#[derive(Clone, Copy, Debug)]
pub struct WindowHandles {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Instance extensions needed to present on the given display.
pub fn required_instance_extensions(display: RawDisplayHandle) -> RenderResult<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(RenderError::UnsupportedPlatform(format!(
                "no surface extension for {other:?}"
            )))
        }
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// What the surface supports on one physical device.
#[derive(Clone, Debug)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

pub struct Surface {
    pub loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(entry: &Entry, instance: &ash::Instance, handles: WindowHandles) -> RenderResult<Self> {
        let handle = unsafe { create_platform_surface(entry, instance, handles)? };
        log::debug!("Created presentation surface {:?}", handle);
        Ok(Self {
            loader: khr::Surface::new(entry, instance),
            handle,
        })
    }

    pub fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> RenderResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }
        .context("querying surface support")
    }

    pub fn support(&self, physical_device: vk::PhysicalDevice) -> RenderResult<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.handle)
                    .context("querying surface capabilities")?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.handle)
                    .context("querying surface formats")?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.handle)
                    .context("querying present modes")?,
            })
        }
    }

    /// Must run after every swapchain built on this surface is gone.
    pub fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

unsafe fn create_platform_surface(
    entry: &Entry,
    instance: &ash::Instance,
    handles: WindowHandles,
) -> RenderResult<vk::SurfaceKHR> {
    match (handles.display, handles.window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance)
                .create_win32_surface(&create_info, None)
                .context("creating Win32 surface")
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .ok_or_else(|| RenderError::UnsupportedPlatform("Xlib display handle is null".into()))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(window.window);
            khr::XlibSurface::new(entry, instance)
                .create_xlib_surface(&create_info, None)
                .context("creating Xlib surface")
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .ok_or_else(|| RenderError::UnsupportedPlatform("XCB connection is null".into()))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut vk::xcb_connection_t)
                .window(window.window.get());
            khr::XcbSurface::new(entry, instance)
                .create_xcb_surface(&create_info, None)
                .context("creating XCB surface")
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(window.surface.as_ptr() as *mut vk::wl_surface);
            khr::WaylandSurface::new(entry, instance)
                .create_wayland_surface(&create_info, None)
                .context("creating Wayland surface")
        }
        (display, window) => Err(RenderError::UnsupportedPlatform(format!(
            "unsupported handle pair {display:?} / {window:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, WebDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn wayland_needs_surface_and_wayland_extensions() {
        let mut dummy = 0u8;
        let display = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(
            NonNull::from(&mut dummy).cast(),
        ));
        let extensions = required_instance_extensions(display).unwrap();
        assert_eq!(extensions, vec![khr::Surface::name(), khr::WaylandSurface::name()]);
    }

    #[test]
    fn web_display_is_rejected() {
        let display = RawDisplayHandle::Web(WebDisplayHandle::new());
        assert!(matches!(
            required_instance_extensions(display),
            Err(RenderError::UnsupportedPlatform(_))
        ));
    }
}
