use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

/// Reasons of the Kubernetes events emitted on Project CRs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    ReconcileStarted,
    ClusterResolved,
    CreatingProject,
    ProjectCreated,
    ProjectTakenOver,
    ProjectObserved,
    NamespaceCreated,
    NamespaceAssigned,
    NamespaceMoved,
    NamespaceRemoved,
    NamespaceDeleted,
    NamespaceDiscovered,
    NamespaceManuallyRemoved,
    MemberAdded,
    ReconcileCompleted,
    DeletionStarted,
    ProjectDeleted,
    ClusterNotFound,
    ProjectCreationFailed,
    NamespaceConflict,
    NamespaceProcessingFailed,
    NamespaceRemovalFailed,
    MemberAddFailed,
    ReconcileFailed,
    DeletionFailed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ReconcileStarted => "ReconcileStarted",
            Reason::ClusterResolved => "ClusterResolved",
            Reason::CreatingProject => "CreatingProject",
            Reason::ProjectCreated => "ProjectCreated",
            Reason::ProjectTakenOver => "ProjectTakenOver",
            Reason::ProjectObserved => "ProjectObserved",
            Reason::NamespaceCreated => "NamespaceCreated",
            Reason::NamespaceAssigned => "NamespaceAssigned",
            Reason::NamespaceMoved => "NamespaceMoved",
            Reason::NamespaceRemoved => "NamespaceRemoved",
            Reason::NamespaceDeleted => "NamespaceDeleted",
            Reason::NamespaceDiscovered => "NamespaceDiscovered",
            Reason::NamespaceManuallyRemoved => "NamespaceManuallyRemoved",
            Reason::MemberAdded => "MemberAdded",
            Reason::ReconcileCompleted => "ReconcileCompleted",
            Reason::DeletionStarted => "DeletionStarted",
            Reason::ProjectDeleted => "ProjectDeleted",
            Reason::ClusterNotFound => "ClusterNotFound",
            Reason::ProjectCreationFailed => "ProjectCreationFailed",
            Reason::NamespaceConflict => "NamespaceConflict",
            Reason::NamespaceProcessingFailed => "NamespaceProcessingFailed",
            Reason::NamespaceRemovalFailed => "NamespaceRemovalFailed",
            Reason::MemberAddFailed => "MemberAddFailed",
            Reason::ReconcileFailed => "ReconcileFailed",
            Reason::DeletionFailed => "DeletionFailed",
        }
    }

    fn event_type(&self) -> EventType {
        match self {
            Reason::ClusterNotFound
            | Reason::ProjectCreationFailed
            | Reason::NamespaceConflict
            | Reason::NamespaceProcessingFailed
            | Reason::NamespaceRemovalFailed
            | Reason::MemberAddFailed
            | Reason::ReconcileFailed
            | Reason::DeletionFailed => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Reason::DeletionStarted
            | Reason::ProjectDeleted
            | Reason::DeletionFailed => "Deleting",
            _ => "Reconciling",
        }
    }
}

enum SinkKind {
    Recorder(Recorder),
    #[cfg(test)]
    Buffer(std::sync::Mutex<Vec<(Reason, String)>>),
}

/// Publishes Kubernetes events on the CR being reconciled. Emission is
/// best-effort: a failed publish is logged and never fails the reconcile.
pub struct EventSink {
    kind: SinkKind,
}

impl EventSink {
    pub fn new(recorder: Recorder) -> Self {
        EventSink {
            kind: SinkKind::Recorder(recorder),
        }
    }

    #[cfg(test)]
    pub fn buffered() -> Self {
        EventSink {
            kind: SinkKind::Buffer(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub async fn publish(&self, reason: Reason, note: String) {
        match &self.kind {
            SinkKind::Recorder(recorder) => {
                let event = Event {
                    type_: reason.event_type(),
                    reason: reason.as_str().to_string(),
                    note: Some(note),
                    action: reason.action().to_string(),
                    secondary: None,
                };
                if let Err(e) = recorder.publish(event).await {
                    warn!(error = ?e, reason = reason.as_str(), "cannot publish event");
                }
            }
            #[cfg(test)]
            SinkKind::Buffer(buffer) => {
                buffer.lock().unwrap().push((reason, note));
            }
        }
    }

    #[cfg(test)]
    pub fn recorded(&self) -> Vec<(Reason, String)> {
        match &self.kind {
            SinkKind::Buffer(buffer) => buffer.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn has_reason(&self, reason: Reason) -> bool {
        self.recorded().iter().any(|(r, _)| *r == reason)
    }
}
