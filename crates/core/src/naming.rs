//! Naming conventions for job directories and artifact files.
//!
//! Project codes look like `AR47-0028`: a channel prefix, a dash, and a
//! sequence. Every job directory contains `<code>_manifest.json` and an
//! `img/` folder holding one file per generated sub-task.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::CoreError;

/// Folder inside a job directory that holds generated artifacts.
pub const ARTIFACT_DIR: &str = "img";

/// Extensions counted as generated artifacts.
pub const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "mp4"];

/// Maximum length of a project code.
const MAX_CODE_LEN: usize = 64;

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<channel>[A-Za-z0-9]+)-[A-Za-z0-9_]+$").expect("static regex is valid")
    })
}

/// Validate a project code before it is used as a path component.
pub fn validate_project_code(code: &str) -> Result<(), CoreError> {
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(CoreError::Validation(format!(
            "Project code must be 1..={MAX_CODE_LEN} characters"
        )));
    }
    if !code_pattern().is_match(code) {
        return Err(CoreError::Validation(format!(
            "Invalid project code '{code}'. Expected <channel>-<sequence>"
        )));
    }
    Ok(())
}

/// The channel prefix of a project code.
///
/// ```
/// use reelforge_core::naming::channel_of;
///
/// assert_eq!(channel_of("AR47-0028"), Some("AR47"));
/// assert_eq!(channel_of("no_dash"), None);
/// ```
pub fn channel_of(code: &str) -> Option<&str> {
    code_pattern()
        .captures(code)
        .and_then(|c| c.name("channel"))
        .map(|m| m.as_str())
}

/// Whether `code` belongs to `channel`. No channel filter accepts all.
pub fn matches_channel(code: &str, channel: Option<&str>) -> bool {
    match channel {
        None => true,
        Some(wanted) => channel_of(code).is_some_and(|c| c.eq_ignore_ascii_case(wanted)),
    }
}

/// Whether a source entry called `name` belongs to `code`.
///
/// The name must be the code itself or continue with a separator, so
/// `AR1-1` never claims the inputs of `AR1-10`.
///
/// ```
/// use reelforge_core::naming::names_code;
///
/// assert!(names_code("AR35-0001.mp3", "AR35-0001"));
/// assert!(names_code("AR35-0001-log.dgt", "AR35-0001"));
/// assert!(!names_code("AR35-00012.mp3", "AR35-0001"));
/// ```
pub fn names_code(name: &str, code: &str) -> bool {
    match name.strip_prefix(code) {
        Some(rest) => rest.chars().next().map_or(true, |c| !c.is_alphanumeric()),
        None => false,
    }
}

/// File name of a job's manifest.
pub fn manifest_file_name(code: &str) -> String {
    format!("{code}_manifest.json")
}

/// Candidate output file names for a sub-task; any one existing means done.
pub fn artifact_file_names(subtask_id: &str) -> [String; 2] {
    [format!("{subtask_id}.png"), format!("{subtask_id}.mp4")]
}

/// The file name a new image artifact is written to.
pub fn image_file_name(subtask_id: &str) -> String {
    format!("{subtask_id}.png")
}

/// Whether a file name has an artifact extension.
pub fn is_artifact_file(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(_, ext)| {
        ARTIFACT_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_codes() {
        assert!(validate_project_code("AR47-0028").is_ok());
        assert!(validate_project_code("KA1-T1_03").is_ok());
    }

    #[test]
    fn path_like_codes_rejected() {
        assert!(validate_project_code("").is_err());
        assert!(validate_project_code("../etc").is_err());
        assert!(validate_project_code("AR1-00/1").is_err());
        assert!(validate_project_code("AR1").is_err());
        assert!(validate_project_code(&format!("A-{}", "1".repeat(80))).is_err());
    }

    #[test]
    fn channel_filter() {
        assert!(matches_channel("AR47-0028", None));
        assert!(matches_channel("AR47-0028", Some("ar47")));
        assert!(!matches_channel("AR47-0028", Some("AR35")));
        assert!(!matches_channel("garbage", Some("AR35")));
    }

    #[test]
    fn source_names_need_a_separator_after_the_code() {
        assert!(names_code("AR1-1", "AR1-1"));
        assert!(names_code("AR1-1.mp3", "AR1-1"));
        assert!(names_code("AR1-1_voice.wav", "AR1-1"));
        assert!(!names_code("AR1-10.mp3", "AR1-1"));
        assert!(!names_code("AR1-1a.mp3", "AR1-1"));
        assert!(!names_code("KA1-1.mp3", "AR1-1"));
    }

    #[test]
    fn artifact_names() {
        assert_eq!(manifest_file_name("AR1-0001"), "AR1-0001_manifest.json");
        assert_eq!(artifact_file_names("loc1"), ["loc1.png", "loc1.mp4"]);
        assert!(is_artifact_file("scene_001.PNG"));
        assert!(is_artifact_file("3.mp4"));
        assert!(!is_artifact_file("notes.txt"));
        assert!(!is_artifact_file("png"));
    }
}
