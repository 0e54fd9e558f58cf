//! Environment helpers for the detection program's child environment.

/// Expand a whole-value placeholder (`${VAR_NAME}`).
///
/// Unset variables and anything that is not exactly one placeholder are
/// returned unchanged.
///
/// ```
/// use dsctl::utils::env::expand_env_var;
///
/// assert_eq!(expand_env_var("plain"), "plain");
/// assert_eq!(expand_env_var("${DSCTL_DOC_UNSET_VAR}"), "${DSCTL_DOC_UNSET_VAR}");
/// ```
pub fn expand_env_var(value: &str) -> String {
    if !value.starts_with("${") || !value.ends_with('}') || value.len() <= 3 {
        return value.to_string();
    }

    let var_name = &value[2..value.len() - 1];
    std::env::var(var_name).unwrap_or_else(|_| value.to_string())
}

/// Parse a `KEY=VALUE` assignment as given to `--env`.
pub fn parse_env_assignment(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("'{}' is not in KEY=VALUE form", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("'{}' has an empty variable name", raw));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(format!("'{}' is not a valid variable name", key));
    }
    Ok((key.to_string(), expand_env_var(value)))
}
