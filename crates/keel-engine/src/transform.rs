//! Transformation hooks.
//!
//! A transformation is a pure function over a resource declaration, applied
//! to every declaration of a stack, in registration order, before the graph
//! is built.

use keel_config::TransformSpec;
use keel_config::stack::Selector;
use keel_core::ResourceDeclaration;
use keel_core::resource::ReadinessPolicy;
use std::sync::Arc;

pub type Transformation = Arc<dyn Fn(ResourceDeclaration) -> ResourceDeclaration + Send + Sync>;

#[derive(Clone, Default)]
pub struct Transformations {
    hooks: Vec<Transformation>,
}

impl std::fmt::Debug for Transformations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transformations({} hooks)", self.hooks.len())
    }
}

impl Transformations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[TransformSpec]) -> Self {
        let mut transforms = Self::new();
        for spec in specs {
            transforms.push(from_spec(spec.clone()));
        }
        transforms
    }

    pub fn push(&mut self, hook: Transformation) {
        self.hooks.push(hook);
    }

    pub fn with(
        mut self,
        hook: impl Fn(ResourceDeclaration) -> ResourceDeclaration + Send + Sync + 'static,
    ) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn with_hook(mut self, hook: Transformation) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn apply(&self, declarations: Vec<ResourceDeclaration>) -> Vec<ResourceDeclaration> {
        declarations
            .into_iter()
            .map(|decl| self.hooks.iter().fold(decl, |d, hook| hook(d)))
            .collect()
    }
}

fn selected(
    selector: Selector,
    f: impl Fn(ResourceDeclaration) -> ResourceDeclaration + Send + Sync + 'static,
) -> Transformation {
    Arc::new(move |decl| if selector.matches(&decl) { f(decl) } else { decl })
}

/// Turn off readiness polling for matching resources.
pub fn skip_await(selector: Selector) -> Transformation {
    selected(selector, |mut decl| {
        decl.options.readiness = ReadinessPolicy::SkipAwait;
        decl
    })
}

/// Exclude fields from diff and drift detection on matching resources.
pub fn ignore_changes(selector: Selector, fields: Vec<String>) -> Transformation {
    selected(selector, move |mut decl| {
        for field in &fields {
            if !decl.options.ignore_changes.contains(field) {
                decl.options.ignore_changes.push(field.clone());
            }
        }
        decl
    })
}

/// Add a metadata annotation to matching resources.
pub fn annotate(selector: Selector, key: String, value: String) -> Transformation {
    selected(selector, move |mut decl| {
        decl.annotate(&key, &value);
        decl
    })
}

/// Add a metadata label to matching resources.
pub fn label(selector: Selector, key: String, value: String) -> Transformation {
    selected(selector, move |mut decl| {
        decl.label(&key, &value);
        decl
    })
}

pub fn from_spec(spec: TransformSpec) -> Transformation {
    match spec {
        TransformSpec::SkipAwait { selector } => skip_await(selector),
        TransformSpec::IgnoreChanges { selector, fields } => ignore_changes(selector, fields),
        TransformSpec::Annotate {
            selector,
            key,
            value,
        } => annotate(selector, key, value),
        TransformSpec::Label {
            selector,
            key,
            value,
        } => label(selector, key, value),
    }
}
