/// Returned when a persisted status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[doc(hidden)]
#[macro_export]
macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum! {
    MachineStatus, "machine status" {
        Online => "ONLINE",
        Offline => "OFFLINE",
        Error => "ERROR",
    }
}

status_enum! {
    AgentStatus, "agent status" {
        Online => "ONLINE",
        Offline => "OFFLINE",
        Error => "ERROR",
        Updating => "UPDATING",
    }
}

status_enum! {
    /// Lifecycle status of a game server process. Independent of [`InstallState`].
    ServerStatus, "server status" {
        Offline => "OFFLINE",
        Starting => "STARTING",
        Online => "ONLINE",
        Stopping => "STOPPING",
        Provisioning => "PROVISIONING",
        Error => "ERROR",
    }
}

status_enum! {
    InstallState, "install state" {
        NotInstalled => "NOT_INSTALLED",
        Installing => "INSTALLING",
        Installed => "INSTALLED",
        Error => "ERROR",
    }
}

status_enum! {
    TaskType, "task type" {
        Provision => "PROVISION",
        Start => "START",
        Stop => "STOP",
        Restart => "RESTART",
        Update => "UPDATE",
        Backup => "BACKUP",
        Delete => "DELETE",
        InstallAgent => "INSTALL_AGENT",
    }
}

status_enum! {
    TaskStatus, "task status" {
        Pending => "PENDING",
        Running => "RUNNING",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Cancelled => "CANCELLED",
    }
}

status_enum! {
    TransferStatus, "transfer status" {
        Pending => "PENDING",
        Approved => "APPROVED",
        Transferred => "TRANSFERRED",
        Rejected => "REJECTED",
        Failed => "FAILED",
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Task status only moves forward: PENDING -> RUNNING | CANCELLED and
    /// RUNNING -> COMPLETED | FAILED.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl TransferStatus {
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        matches!(
            (self, next),
            (TransferStatus::Pending, TransferStatus::Approved)
                | (TransferStatus::Pending, TransferStatus::Rejected)
                | (TransferStatus::Approved, TransferStatus::Transferred)
                | (TransferStatus::Approved, TransferStatus::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_task_statuses_never_transition() {
        for from in TaskStatus::ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn running_cannot_be_cancelled() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ServerStatus::ALL {
            assert_eq!(s.as_str().parse::<ServerStatus>().unwrap(), *s);
        }
        assert_eq!(
            "INSTALL_AGENT".parse::<TaskType>().unwrap(),
            TaskType::InstallAgent
        );
        let err = "BOGUS".parse::<AgentStatus>().unwrap_err();
        assert_eq!(err.kind, "agent status");
    }

    #[test]
    fn serde_uses_screaming_names() {
        let json = serde_json::to_string(&InstallState::NotInstalled).unwrap();
        assert_eq!(json, "\"NOT_INSTALLED\"");
    }
}
