pub fn env_truthy_with<F>(var: &str, env_get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env_get(var).map(|value| is_truthy(&value)).unwrap_or(false)
}

/// Reads a boolean variable, keeping `default` when it is unset.
pub fn env_flag_with<F>(var: &str, default: bool, env_get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match env_get(var) {
        Some(value) if is_truthy(&value) => true,
        Some(value) if is_falsy(&value) => false,
        _ => default,
    }
}

pub fn env_parse_with<T, F>(var: &str, env_get: &F) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    env_get(var).and_then(|value| value.trim().parse().ok())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

pub fn is_falsy(value: &str) -> bool {
    matches!(value, "0" | "false" | "no" | "off")
}
