use multiboot_core::Disk;
use std::path::Path;
use uuid::Uuid;

pub const TOKEN_PREFIX: &str = "MB-";

#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    pub force_mode: bool,
    pub confirmation_token: Option<String>,
    pub allow_overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

/// The two points where a user may still say no.
pub trait ConfirmationGate {
    /// Asked once before the device is repartitioned.
    fn confirm_destructive(&self, device: &Path, disk: Option<&Disk>) -> bool;
    /// Asked when an image with the same name is already on the device.
    fn confirm_overwrite(&self, file_name: &str) -> bool;
}

/// Answers from flags instead of asking.
#[derive(Debug, Clone, Default)]
pub struct NonInteractiveGate {
    pub context: SafetyContext,
}

impl ConfirmationGate for NonInteractiveGate {
    fn confirm_destructive(&self, _device: &Path, disk: Option<&Disk>) -> bool {
        let is_system_disk = disk.map(|disk| disk.is_system_disk).unwrap_or(false);
        can_write_to_disk(&self.context, is_system_disk) == SafetyDecision::Allow
    }

    fn confirm_overwrite(&self, _file_name: &str) -> bool {
        self.context.allow_overwrite
    }
}

pub fn require_confirmation_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4())
}

pub fn can_write_to_disk(ctx: &SafetyContext, is_system_disk: bool) -> SafetyDecision {
    if is_system_disk {
        return SafetyDecision::Deny("Denied: target hosts the running system".to_string());
    }
    if !ctx.force_mode {
        return SafetyDecision::Deny("Denied: destructive ops require force-mode".to_string());
    }

    let Some(token) = &ctx.confirmation_token else {
        return SafetyDecision::Deny("Denied: confirmation token missing".to_string());
    };
    if !token.starts_with(TOKEN_PREFIX) {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    }

    SafetyDecision::Allow
}
