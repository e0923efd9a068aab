use std::fmt;
use std::rc::Rc;

/// Ordered construction hooks.
///
/// `pre_construct` hooks see the raw input before anything is built and may
/// rewrite it. `post_construct` hooks see the finished value. Both run in
/// registration order.
pub struct Hooks<R, B> {
    pre: Vec<Rc<dyn Fn(&mut R)>>,
    post: Vec<Rc<dyn Fn(&B)>>,
}

impl<R, B> Hooks<R, B> {
    pub fn new() -> Self {
        Self {
            pre: Vec::new(),
            post: Vec::new(),
        }
    }

    pub fn pre_construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut R) + 'static,
    {
        self.pre.push(Rc::new(hook));
        self
    }

    pub fn post_construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(&B) + 'static,
    {
        self.post.push(Rc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }

    pub(crate) fn run_pre(&self, raw: &mut R) {
        for hook in &self.pre {
            hook(raw);
        }
    }

    pub(crate) fn run_post(&self, built: &B) {
        for hook in &self.post {
            hook(built);
        }
    }
}

impl<R, B> Default for Hooks<R, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, B> Clone for Hooks<R, B> {
    fn clone(&self) -> Self {
        Self {
            pre: self.pre.clone(),
            post: self.post.clone(),
        }
    }
}

impl<R, B> fmt::Debug for Hooks<R, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_construct", &self.pre.len())
            .field("post_construct", &self.post.len())
            .finish()
    }
}
