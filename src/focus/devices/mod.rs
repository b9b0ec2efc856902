//! Device-level focus resources: exclusive display mode and sleep prevention.
//!
//! Both are best-effort. The controller runs identically whether or not the
//! platform grants them; a missing resource only marks the session unprotected.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

use anyhow::Result as AnyResult;
#[cfg(unix)]
use std::process::{Child, Command, Stdio};
use tracing::info;

use crate::error::{FocusError, Result};

/// A resource held for the duration of a focus session
pub trait FocusResource: Send {
    fn name(&self) -> &str;

    /// Whether this platform can provide the resource at all
    fn is_supported(&self) -> bool;

    fn acquire(&mut self) -> AnyResult<()>;

    /// Release the resource. Safe to call when not held.
    fn release(&mut self);
}

/// Acquire a resource, mapping any failure to `ResourceUnavailable`
pub fn acquire(resource: &mut dyn FocusResource) -> Result<()> {
    let name = resource.name().to_string();
    let unavailable = |reason: String| FocusError::ResourceUnavailable {
        resource: name.clone(),
        reason,
    };

    if !resource.is_supported() {
        return Err(unavailable("not supported on this platform".to_string()));
    }

    resource.acquire().map_err(|e| unavailable(format!("{:#}", e)))?;
    info!("Acquired {}", resource.name());
    Ok(())
}

/// The resources a session tries to hold
pub struct ResourceSet {
    pub display: Box<dyn FocusResource>,
    pub sleep_lock: Box<dyn FocusResource>,
}

impl ResourceSet {
    pub fn new(display: Box<dyn FocusResource>, sleep_lock: Box<dyn FocusResource>) -> Self {
        Self { display, sleep_lock }
    }

    /// Resources available to a process without a display server of its own
    pub fn for_platform() -> Self {
        Self::new(Box::new(HeadlessDisplay), sleep_inhibitor())
    }
}

/// Exclusive display mode belongs to the host UI; a terminal process cannot enter it
pub struct HeadlessDisplay;

impl FocusResource for HeadlessDisplay {
    fn name(&self) -> &str {
        "display"
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn acquire(&mut self) -> AnyResult<()> {
        anyhow::bail!("exclusive display mode requires a host window")
    }

    fn release(&mut self) {}
}

/// Placeholder for a resource the platform does not offer
pub struct Unsupported {
    name: &'static str,
}

impl Unsupported {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl FocusResource for Unsupported {
    fn name(&self) -> &str {
        self.name
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn acquire(&mut self) -> AnyResult<()> {
        anyhow::bail!("{} is not supported on this platform", self.name)
    }

    fn release(&mut self) {}
}

/// The platform's display-sleep inhibitor
pub fn sleep_inhibitor() -> Box<dyn FocusResource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::sleep_inhibitor())
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(macos::sleep_inhibitor())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Box::new(Unsupported::new("sleep_lock"))
    }
}

/// A lock held by keeping a helper process alive; killing it releases the lock
#[cfg(unix)]
pub struct ProcessLock {
    name: &'static str,
    program: &'static str,
    args: Vec<String>,
    child: Option<Child>,
}

#[cfg(unix)]
impl ProcessLock {
    pub fn new(name: &'static str, program: &'static str, args: Vec<String>) -> Self {
        Self {
            name,
            program,
            args,
            child: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(unix)]
impl FocusResource for ProcessLock {
    fn name(&self) -> &str {
        self.name
    }

    fn is_supported(&self) -> bool {
        command_exists(self.program)
    }

    fn acquire(&mut self) -> AnyResult<()> {
        use anyhow::Context;

        if self.child.is_some() {
            return Ok(());
        }

        let mut child = Command::new(self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;

        if let Some(status) = child.try_wait()? {
            anyhow::bail!("{} exited immediately ({})", self.program, status);
        }

        tracing::debug!("{} holding {} (pid {})", self.program, self.name, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::warn!("Failed to stop {} for {}: {}", self.program, self.name, e);
            }
            let _ = child.wait();
            info!("Released {}", self.name);
        }
    }
}

#[cfg(unix)]
impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Check whether a program can be found on PATH
#[cfg(unix)]
fn command_exists(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
