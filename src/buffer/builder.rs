//! Content builders.
//!
//! A builder regenerates (part of) a buffer's content from some source of
//! truth. Builders are appended to a [`BuilderChain`] in arrival order and the
//! whole chain is replayed, in that order, every time purged content has to be
//! rebuilt.

use std::fmt;

/// A unit that (re)populates buffer content.
///
/// `build` receives the buffer's live bytes (exactly the declared size) and
/// returns `false` if it could not produce them.
///
/// Any `FnMut(&mut [u8]) -> bool` closure is a builder:
///
/// ```
/// use purgemem::buffer::PurgeableBuilder;
///
/// let mut fill = |data: &mut [u8]| {
///     data.fill(b'x');
///     true
/// };
/// let mut buf = [0u8; 4];
/// assert!(fill.build(&mut buf));
/// assert_eq!(&buf, b"xxxx");
/// ```
pub trait PurgeableBuilder: Send + Sync {
    fn build(&mut self, data: &mut [u8]) -> bool;
}

impl<F> PurgeableBuilder for F
where
    F: FnMut(&mut [u8]) -> bool + Send + Sync,
{
    fn build(&mut self, data: &mut [u8]) -> bool {
        self(data)
    }
}

type RebuildCallback = Box<dyn Fn() + Send + Sync>;

/// Ordered, owned sequence of builders plus an optional notification fired
/// after every successful rebuild.
#[derive(Default)]
pub struct BuilderChain {
    builders: Vec<Box<dyn PurgeableBuilder>>,
    on_rebuild: Option<RebuildCallback>,
}

impl BuilderChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain holding a single builder.
    pub fn with(builder: Box<dyn PurgeableBuilder>) -> Self {
        let mut chain = Self::new();
        chain.append(builder);
        chain
    }

    /// Append `builder`; it runs after every builder already in the chain.
    pub fn append(&mut self, builder: Box<dyn PurgeableBuilder>) {
        self.builders.push(builder);
    }

    /// Replay every builder over `data` in order.
    ///
    /// Stops at the first failure. An empty chain cannot produce content and
    /// reports failure.
    pub fn build_all(&mut self, data: &mut [u8]) -> bool {
        if self.builders.is_empty() {
            return false;
        }
        self.builders.iter_mut().all(|b| b.build(data))
    }

    pub fn set_rebuild_success_callback<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_rebuild = Some(Box::new(callback));
    }

    pub(crate) fn notify_rebuild_success(&self) {
        if let Some(cb) = &self.on_rebuild {
            cb();
        }
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

impl fmt::Debug for BuilderChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderChain")
            .field("builders", &self.builders.len())
            .field("on_rebuild", &self.on_rebuild.is_some())
            .finish()
    }
}
