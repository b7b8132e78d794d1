//! Reference-counted handles to renderer objects.
//!
//! Clones of a handle share one count. When the last clone is dropped a
//! [`Release`] message goes to the renderer, which removes the object the next
//! time it drains its release channel, after a single device idle wait.

use crossbeam::channel::Sender;
use std::fmt;
use std::sync::Arc;

macro_rules! object_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

object_id!(RenderPassId, "render-pass");
object_id!(PipelineId, "pipeline");
object_id!(CommandId, "command");

/// Object whose last handle was dropped.
///
/// Ordered so that dependents sort before what they depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Release {
    Command(CommandId),
    Pipeline(PipelineId),
    RenderPass(RenderPassId),
}

/// Sends the release message when the last handle goes away.
struct Tracker {
    release: Release,
    sender: Sender<Release>,
}

impl Drop for Tracker {
    fn drop(&mut self) {
        // The renderer may already be gone, in which case nothing is left to release.
        let _ = self.sender.send(self.release);
    }
}

fn tracker(release: Release, sender: &Sender<Release>) -> Arc<Tracker> {
    Arc::new(Tracker {
        release,
        sender: sender.clone(),
    })
}

/// Handle to a render pass.
#[derive(Clone)]
pub struct RenderPassHandle {
    id: RenderPassId,
    tracker: Arc<Tracker>,
}

impl RenderPassHandle {
    pub(crate) fn new(id: RenderPassId, sender: &Sender<Release>) -> Self {
        Self {
            id,
            tracker: tracker(Release::RenderPass(id), sender),
        }
    }

    pub const fn id(&self) -> RenderPassId {
        self.id
    }

    /// Number of live clones of this handle.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.tracker)
    }
}

/// Handle to a pipeline. Keeps the render pass it was created for alive.
#[derive(Clone)]
pub struct PipelineHandle {
    id: PipelineId,
    // Dropped before `render_pass`, so the pipeline is released first.
    tracker: Arc<Tracker>,
    render_pass: RenderPassHandle,
}

impl PipelineHandle {
    pub(crate) fn new(id: PipelineId, render_pass: RenderPassHandle, sender: &Sender<Release>) -> Self {
        Self {
            id,
            tracker: tracker(Release::Pipeline(id), sender),
            render_pass,
        }
    }

    pub const fn id(&self) -> PipelineId {
        self.id
    }

    pub const fn render_pass(&self) -> &RenderPassHandle {
        &self.render_pass
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.tracker)
    }
}

/// Handle to a command.
#[derive(Clone)]
pub struct CommandHandle {
    id: CommandId,
    tracker: Arc<Tracker>,
}

impl CommandHandle {
    pub(crate) fn new(id: CommandId, sender: &Sender<Release>) -> Self {
        Self {
            id,
            tracker: tracker(Release::Command(id), sender),
        }
    }

    pub const fn id(&self) -> CommandId {
        self.id
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.tracker)
    }
}

impl fmt::Debug for RenderPassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RenderPassHandle").field(&self.id).finish()
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.id)
            .field("render_pass", &self.render_pass.id)
            .finish()
    }
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandHandle").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn last_clone_sends_one_release() {
        let (tx, rx) = unbounded();
        let handle = CommandHandle::new(CommandId(7), &tx);
        let clone = handle.clone();
        assert_eq!(handle.ref_count(), 2);

        drop(handle);
        assert!(rx.try_recv().is_err());

        drop(clone);
        assert_eq!(rx.try_recv().ok(), Some(Release::Command(CommandId(7))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pipeline_keeps_render_pass_alive() {
        let (tx, rx) = unbounded();
        let render_pass = RenderPassHandle::new(RenderPassId(1), &tx);
        let pipeline = PipelineHandle::new(PipelineId(2), render_pass.clone(), &tx);

        drop(render_pass);
        assert!(rx.try_recv().is_err());

        drop(pipeline);
        let released: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            released,
            vec![
                Release::Pipeline(PipelineId(2)),
                Release::RenderPass(RenderPassId(1))
            ]
        );
    }

    #[test]
    fn releases_sort_dependents_first() {
        let mut releases = vec![
            Release::RenderPass(RenderPassId(1)),
            Release::Command(CommandId(3)),
            Release::Pipeline(PipelineId(2)),
        ];
        releases.sort();
        assert!(matches!(releases[0], Release::Command(_)));
        assert!(matches!(releases[2], Release::RenderPass(_)));
    }
}
