use std::{fs, path::Path, sync::LazyLock};

use regex::Regex;


static FUNCTION_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:function|fn)\s+(\w+)").expect("function declaration pattern")
});

/// Names this short or shorter are what minifiers and transpilers emit.
const MAX_MANGLED_NAME_LEN: usize = 3;


/// Best-effort guess whether the entry source was transpiled or minified,
/// which makes heap/line correlation unreliable later on.
///
/// `Some(true)` when no declared function has a name longer than three
/// characters. `None` when the file can't be read, which callers treat as
/// "no warning".
pub fn looks_transpiled(path: &Path) -> Option<bool> {
    match fs::read_to_string(path) {
        Ok(source) => Some(!has_descriptive_names(&source)),
        Err(err) => {
            tracing::debug!("Source check skipped for {}: {}", path.display(), err);
            None
        }
    }
}

pub fn has_descriptive_names(source: &str) -> bool {
    FUNCTION_DECL
        .captures_iter(source)
        .filter_map(|caps| caps.get(1))
        .any(|name| name.as_str().chars().count() > MAX_MANGLED_NAME_LEN)
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn descriptive_names_pass() {
        assert!(has_descriptive_names("function a(){}\nfunction loadConfig () {}"));
        assert!(has_descriptive_names("pub fn sample_once() {}"));
    }

    #[test]
    fn mangled_names_are_flagged() {
        assert!(!has_descriptive_names("function a(b){return b}function xyz(){}"));
        assert!(!has_descriptive_names("const f = () => 1"));
        // a name of exactly three characters is still considered mangled
        assert!(!has_descriptive_names("fn foo() {}"));
    }

    #[test]
    fn reads_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "function e(t){{}}function n(t){{}}").unwrap();
        assert_eq!(looks_transpiled(file.path()), Some(true));
    }

    #[test]
    fn unreadable_file_is_inconclusive() {
        assert_eq!(looks_transpiled(Path::new("/definitely/not/here.js")), None);
    }
}
