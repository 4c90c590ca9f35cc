use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;

use anyhow::{bail, Context, Result};
use libloading::Library;
use thiserror::Error;

use crate::IGNORE_LABELS;

/// Per-tick inference failure. Recoverable: the caller skips the tick and
/// keeps its debounce state untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference failed with status {0}")]
    Status(i32),
}

/// One inference outcome: a score per category, in category-list order.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    pub values: Vec<f32>,
    pub top_index: usize,
}

impl Scores {
    /// Argmax over the raw scores; ties resolve to the first maximum.
    pub fn from_values(values: Vec<f32>) -> Self {
        assert!(!values.is_empty(), "classifier returned no scores");
        let mut top_index = 0;
        for (i, &v) in values.iter().enumerate() {
            if v > values[top_index] {
                top_index = i;
            }
        }
        Self { values, top_index }
    }

    pub fn top(&self) -> f32 {
        self.values[self.top_index]
    }
}

/// The inference engine the sliding-window pipeline runs against.
///
/// The production implementation is [`NativeModel`]; tests substitute
/// scripted classifiers.
pub trait Classifier {
    /// Category list in model output order, fetched once at startup.
    fn categories(&self) -> &[String];

    /// Exact number of PCM samples one `classify` call consumes.
    fn input_frame_size(&self) -> usize;

    /// Run one inference over exactly [`Classifier::input_frame_size`]
    /// samples. Feeding any other count is a caller bug and panics.
    fn classify(&mut self, samples: &[i16]) -> Result<Scores, InferenceError>;

    /// Categories a shell can act on: everything but the ignore labels.
    fn commands(&self) -> Vec<String> {
        self.categories()
            .iter()
            .filter(|c| !IGNORE_LABELS.contains(&c.as_str()))
            .cloned()
            .collect()
    }
}

/// Category count and model output count come from independent getters;
/// they must agree before any inference is attempted.
pub fn validate_counts(category_count: u32, label_count: u32) -> Result<()> {
    if category_count != label_count {
        bail!(
            "category count ({category_count}) != model output count ({label_count})"
        );
    }
    if category_count == 0 {
        bail!("model reports zero categories");
    }
    Ok(())
}

type GetU32Fn = unsafe extern "C" fn() -> u32;
type GetCategoryFn = unsafe extern "C" fn(u32) -> *const c_char;
type RunInferenceFn = unsafe extern "C" fn(*const i16, u32, *mut f32, *mut u32) -> i32;

/// The native inference engine, loaded from a shared library at startup.
///
/// Symbol contract: `get_category_count`, `get_category`,
/// `get_input_frame_size`, `get_label_count` and
/// `run_inference(int16* in, uint32 in_len, float* out_scores,
/// uint32* out_label) -> int32` with status 0 on success.
pub struct NativeModel {
    categories: Vec<String>,
    input_frame_size: usize,
    run_inference: RunInferenceFn,
    /// Keeps the shared library mapped for as long as `run_inference` may
    /// be called.
    _lib: Library,
}

impl NativeModel {
    pub fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .with_context(|| format!("failed to load inference library {}", path.display()))?;

        let get_category_count = get_symbol::<GetU32Fn>(&lib, "get_category_count")?;
        let get_category = get_symbol::<GetCategoryFn>(&lib, "get_category")?;
        let get_input_frame_size = get_symbol::<GetU32Fn>(&lib, "get_input_frame_size")?;
        let get_label_count = get_symbol::<GetU32Fn>(&lib, "get_label_count")?;
        let run_inference = get_symbol::<RunInferenceFn>(&lib, "run_inference")?;

        let category_count = unsafe { get_category_count() };
        let label_count = unsafe { get_label_count() };
        validate_counts(category_count, label_count)?;

        let mut categories = Vec::with_capacity(category_count as usize);
        for i in 0..category_count {
            let ptr = unsafe { get_category(i) };
            if ptr.is_null() {
                bail!("get_category({i}) returned a null pointer");
            }
            let label = unsafe { CStr::from_ptr(ptr) }
                .to_str()
                .with_context(|| format!("category {i} is not valid UTF-8"))?;
            categories.push(label.to_owned());
        }

        let input_frame_size = unsafe { get_input_frame_size() } as usize;
        if input_frame_size == 0 {
            bail!("model reports a zero input frame size");
        }

        Ok(Self {
            categories,
            input_frame_size,
            run_inference,
            _lib: lib,
        })
    }
}

fn get_symbol<T: Copy>(lib: &Library, name: &str) -> Result<T> {
    let symbol = unsafe { lib.get::<T>(name.as_bytes()) }
        .with_context(|| format!("inference library is missing symbol `{name}`"))?;
    Ok(*symbol)
}

impl Classifier for NativeModel {
    fn categories(&self) -> &[String] {
        &self.categories
    }

    fn input_frame_size(&self) -> usize {
        self.input_frame_size
    }

    fn classify(&mut self, samples: &[i16]) -> Result<Scores, InferenceError> {
        assert_eq!(
            samples.len(),
            self.input_frame_size,
            "classify() expects exactly {} samples",
            self.input_frame_size
        );
        let mut values = vec![0.0f32; self.categories.len()];
        let mut label_index: u32 = 0;
        let status = unsafe {
            (self.run_inference)(
                samples.as_ptr(),
                samples.len() as u32,
                values.as_mut_ptr(),
                &mut label_index,
            )
        };
        if status != 0 {
            return Err(InferenceError::Status(status));
        }
        // The host-side argmax is authoritative; the out-label is only a
        // convenience for C callers.
        Ok(Scores::from_values(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_mismatch_is_fatal_before_inference() {
        assert!(validate_counts(7, 6).is_err());
        assert!(validate_counts(6, 7).is_err());
        assert!(validate_counts(6, 6).is_ok());
    }

    #[test]
    fn zero_categories_rejected() {
        assert!(validate_counts(0, 0).is_err());
    }

    #[test]
    fn argmax_picks_first_of_ties() {
        let scores = Scores::from_values(vec![0.1, 0.7, 0.7, 0.2]);
        assert_eq!(scores.top_index, 1);
        assert_eq!(scores.top(), 0.7);
    }

    #[test]
    fn commands_exclude_ignore_labels() {
        struct Fixed(Vec<String>);
        impl Classifier for Fixed {
            fn categories(&self) -> &[String] {
                &self.0
            }
            fn input_frame_size(&self) -> usize {
                16000
            }
            fn classify(&mut self, _samples: &[i16]) -> Result<Scores, InferenceError> {
                unreachable!()
            }
        }
        let model = Fixed(
            ["next", "back", "silence", "background", "unknown"]
                .map(String::from)
                .to_vec(),
        );
        assert_eq!(model.commands(), vec!["next", "back"]);
    }
}
