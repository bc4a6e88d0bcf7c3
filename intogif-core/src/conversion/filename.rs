//! Staging name derivation

/// Base name used for staged inputs that carry an extension
pub const STAGED_BASE_NAME: &str = "input";

/// Derive the name under which an input file is staged.
///
/// Names without a dot are kept as-is. Otherwise the part before the first
/// dot is replaced by `input`, keeping everything from the first dot on, so
/// `clip.mov` becomes `input.mov`, `archive.tar.gz` becomes `input.tar.gz`
/// and `.hidden` becomes `input.hidden`.
pub fn normalize(name: &str) -> String {
    match name.find('.') {
        Some(first_dot) => format!("{STAGED_BASE_NAME}{}", &name[first_dot..]),
        None => name.to_string(),
    }
}
