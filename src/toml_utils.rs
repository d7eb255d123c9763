//! Helper functions to [`toml_span`].

use std::borrow::Cow;

use toml_span::DeserError;

/// Deserialize a TOML string into a value of the specified type.
pub fn from_toml_str<'de, T>(toml_str: &'de str) -> Result<T, DeserError>
where
    T: toml_span::Deserialize<'de>,
{
    let mut value = toml_span::parse(toml_str)?;
    T::deserialize(&mut value)
}

/// Create a custom [`DeserError`] with a span.
pub fn custom_deser_error(
    span: toml_span::Span,
    msg: impl Into<Cow<'static, str>>,
) -> DeserError {
    let err_kind = toml_span::ErrorKind::Custom(msg.into());
    let err = toml_span::Error::from((err_kind, span));
    DeserError::from(err)
}

/// Format every error in a [`DeserError`], one per line, with the line number
/// where it happened.
pub fn describe_deser_error(toml_str: &str, err: &DeserError) -> String {
    err.errors
        .iter()
        .map(|err| {
            let start = err.span.start.min(toml_str.len());
            let line = toml_str[..start].matches('\n').count() + 1;
            format!("line {}: {}", line, err)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
