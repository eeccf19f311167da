//! Optional learned-classifier capabilities for the acceptance gate.
//!
//! Both capabilities are injected into the validator. A missing classifier is a
//! normal configuration: the corresponding stages pass through.

use std::cell::{OnceCell, RefCell};

use image::DynamicImage;
use log::{debug, info};

/// Scores one image against a fixed set of text prompts.
pub trait ZeroShotClassifier {
    /// Returns one probability per prompt, in prompt order.
    fn score_prompts(&self, image: &DynamicImage, prompts: &[&str]) -> Result<Vec<f32>, String>;
}

/// Predicts object-category labels for one image.
pub trait CategoryClassifier {
    /// Returns at most `k` `(label, probability)` pairs, most likely first.
    fn top_labels(&self, image: &DynamicImage, k: usize) -> Result<Vec<(String, f32)>, String>;
}

type Factory<T> = Box<dyn FnOnce() -> Option<Box<T>>>;

/// A classifier handle built at most once, on first use, then reused.
pub struct LazyClassifier<T: ?Sized> {
    name: &'static str,
    factory: RefCell<Option<Factory<T>>>,
    instance: OnceCell<Option<Box<T>>>,
}

impl<T: ?Sized> LazyClassifier<T> {
    /// A handle whose factory runs on first `get`. Returning `None` from the
    /// factory marks the capability unavailable for the rest of the run.
    #[cfg(test)]
    pub fn new(name: &'static str, factory: impl FnOnce() -> Option<Box<T>> + 'static) -> Self {
        Self {
            name,
            factory: RefCell::new(Some(Box::new(factory))),
            instance: OnceCell::new(),
        }
    }

    pub fn ready(name: &'static str, instance: Box<T>) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(Some(instance));
        Self {
            name,
            factory: RefCell::new(None),
            instance: cell,
        }
    }

    pub fn unavailable(name: &'static str) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(None);
        Self {
            name,
            factory: RefCell::new(None),
            instance: cell,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> Option<&T> {
        self.instance
            .get_or_init(|| {
                let factory = self.factory.borrow_mut().take();
                let built = factory.and_then(|factory| factory());
                if built.is_some() {
                    info!("{} classifier ready", self.name);
                } else {
                    debug!("{} classifier unavailable; stage will pass through", self.name);
                }
                built
            })
            .as_deref()
    }
}
