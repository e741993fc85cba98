use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One ground-truth box: class index plus a normalized center-form box.
///
/// `cx`, `cy` locate the box center relative to the full image; `w`, `h`
/// are the box extent relative to the full image. All four live in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub class_id: usize,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Annotation file contents for a single image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLabel {
    pub image: String,
    pub objects: Vec<Annotation>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("coordinate not finite: ({0}, {1}, {2}, {3})")]
    NonFiniteBox(f32, f32, f32, f32),
    #[error("center out of range: ({0}, {1})")]
    CenterOutOfRange(f32, f32),
    #[error("non-positive box extent: ({0}, {1})")]
    EmptyBox(f32, f32),
    #[error("missing image path in label")]
    MissingImage,
    #[error("empty class list")]
    EmptyClassList,
    #[error("blank class name at index {0}")]
    BlankClassName(usize),
}

impl Annotation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let vals = [self.cx, self.cy, self.w, self.h];
        if vals.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteBox(
                self.cx, self.cy, self.w, self.h,
            ));
        }
        if !(0.0..=1.0).contains(&self.cx) || !(0.0..=1.0).contains(&self.cy) {
            return Err(ValidationError::CenterOutOfRange(self.cx, self.cy));
        }
        if self.w <= 0.0 || self.h <= 0.0 {
            return Err(ValidationError::EmptyBox(self.w, self.h));
        }
        Ok(())
    }
}

impl ImageLabel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::MissingImage);
        }
        for object in &self.objects {
            object.validate()?;
        }
        Ok(())
    }
}

/// Ordered class names; the index of a name is its `class_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassList {
    names: Vec<String>,
}

impl ClassList {
    pub fn new(names: Vec<String>) -> Result<Self, ValidationError> {
        if names.is_empty() {
            return Err(ValidationError::EmptyClassList);
        }
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ValidationError::BlankClassName(i));
            }
        }
        Ok(Self { names })
    }

    /// Parse a class file: one name per line, blank lines ignored.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let names = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(names)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_centers_are_valid() {
        let ann = Annotation {
            class_id: 0,
            cx: 1.0,
            cy: 0.0,
            w: 0.5,
            h: 0.5,
        };
        assert!(ann.validate().is_ok());
    }

    #[test]
    fn nan_coordinate_rejected() {
        let ann = Annotation {
            class_id: 0,
            cx: f32::NAN,
            cy: 0.5,
            w: 0.5,
            h: 0.5,
        };
        assert!(matches!(
            ann.validate(),
            Err(ValidationError::NonFiniteBox(..))
        ));
    }

    #[test]
    fn class_list_parse_skips_blank_lines() {
        let list = ClassList::parse("person\n\ndog\n").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.name(1), Some("dog"));
    }
}
