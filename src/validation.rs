//! Small validators shared by the settings loader and the engine setters.

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Validates that a path could name an output file.
///
/// # Arguments
///
/// * `path` - The path to validate.
///
/// # Returns
///
/// * `Ok(())` if the path is syntactically usable.
/// * `Err(&'static str)` describing the problem otherwise.
pub fn is_valid_path(path: &Path) -> Result<(), &'static str> {
    let text = path.as_os_str();
    if text.is_empty() {
        return Err("File path cannot be empty");
    }
    if text.as_encoded_bytes().contains(&0) {
        return Err("File path cannot contain null bytes");
    }
    if path.file_name().is_none() {
        return Err("File path must name a file");
    }
    Ok(())
}

/// Validates that the output file can be created where `path` points.
///
/// Checks syntax, that the parent directory exists, and that the path is not a directory.
/// Whether the file is actually writable is only known once it is opened.
pub fn is_writable_location(path: &Path) -> Result<(), &'static str> {
    is_valid_path(path)?;
    if path.is_dir() {
        return Err("File path names a directory");
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err("Parent directory does not exist")
        }
        _ => Ok(()),
    }
}

/// Validates if a given value is within a specified numeric range.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates that a duration is non-zero.
pub fn is_positive_duration(value: Duration) -> Result<(), &'static str> {
    if value.is_zero() {
        Err("Duration must be greater than zero")
    } else {
        Ok(())
    }
}

/// Validates if a given string is not empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.trim().is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rejects_unusable_paths() {
        assert!(is_valid_path(Path::new("")).is_err());
        assert!(is_valid_path(Path::new("/")).is_err());
        assert!(is_valid_path(Path::new("out.bin")).is_ok());
    }

    #[test]
    fn writable_location_needs_existing_parent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_writable_location(&dir.path().join("out.bin")).is_ok());
        assert!(is_writable_location(dir.path()).is_err());

        let missing: PathBuf = dir.path().join("missing").join("out.bin");
        assert_eq!(is_writable_location(&missing), Err("Parent directory does not exist"));

        // bare file names resolve against the working directory
        assert!(is_writable_location(Path::new("out.bin")).is_ok());
    }

    #[test]
    fn range_and_duration_checks() {
        assert!(is_in_range(5usize, 1..=10).is_ok());
        assert!(is_in_range(0usize, 1..=10).is_err());
        assert!(is_positive_duration(Duration::ZERO).is_err());
        assert!(is_not_empty("  ").is_err());
    }
}
