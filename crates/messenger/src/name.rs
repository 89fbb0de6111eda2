use crate::{Error, Result};

/// Split the namespace off a qualified `Namespace:name`.
pub fn namespace_of(name: &str) -> Result<&str> {
    match name.split_once(':') {
        Some((namespace, local)) if !namespace.is_empty() && !local.is_empty() => Ok(namespace),
        _ => Err(Error::InvalidName(name.to_string())),
    }
}

/// Namespaces are bare identifiers: no separator, no whitespace.
pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.contains(':') || namespace.contains(char::is_whitespace) {
        return Err(Error::InvalidName(namespace.to_string()));
    }
    Ok(())
}
