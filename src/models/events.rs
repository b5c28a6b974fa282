use serde::{Deserialize, Serialize};

// Emit events

#[derive(Debug, Clone)]
pub enum EmitEvent {
    /// Background work queued new timeline events; the owner of the
    /// [`Timeline`](crate::Timeline) should call `process_timeline_updates()`.
    TimelineUpdatesPending,
    ToastNotification(ToastNotificationRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastNotificationRequest {
    message: String,
    description: Option<String>,
    variant: ToastNotificationVariant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ToastNotificationVariant {
    Default,
    Description,
    Success,
    Info,
    Warning,
    Error,
}

impl ToastNotificationRequest {
    pub fn new(
        message: String,
        description: Option<String>,
        variant: ToastNotificationVariant,
    ) -> Self {
        if description.is_some() {
            // If there is a description, force the description variant.
            Self {
                message,
                description,
                variant: ToastNotificationVariant::Description,
            }
        } else {
            Self {
                message,
                description: None,
                variant,
            }
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn variant(&self) -> &ToastNotificationVariant {
        &self.variant
    }
}
