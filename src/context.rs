use crate::error::{InvalidWindow, TemplateError};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle naming the connection and credentials a run should use.
/// Resolution happens in the connectors; the executor never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialsRef(String);

impl CredentialsRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-run parameters shared read-only by every task of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRunContext")]
pub struct RunContext {
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    credentials_ref: CredentialsRef,
}

#[derive(Deserialize)]
struct RawRunContext {
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    credentials_ref: CredentialsRef,
}

impl TryFrom<RawRunContext> for RunContext {
    type Error = InvalidWindow;

    fn try_from(raw: RawRunContext) -> Result<Self, Self::Error> {
        Self::new(raw.window_start, raw.window_end, raw.credentials_ref)
    }
}

impl RunContext {
    pub fn new(
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        credentials_ref: CredentialsRef,
    ) -> Result<Self, InvalidWindow> {
        if window_end < window_start {
            return Err(InvalidWindow {
                start: window_start,
                end: window_end,
            });
        }
        Ok(Self {
            window_start,
            window_end,
            credentials_ref,
        })
    }

    /// Window covering the hour that contains `at`.
    pub fn hourly(at: DateTime<Utc>, credentials_ref: CredentialsRef) -> Self {
        let window_start = at
            .with_nanosecond(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_minute(0))
            .unwrap_or(at);
        Self {
            window_start,
            window_end: window_start + Duration::hours(1),
            credentials_ref,
        }
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }

    pub fn credentials_ref(&self) -> &CredentialsRef {
        &self.credentials_ref
    }

    /// Substitutes `{name}` placeholders with values derived from the window
    /// start. Supported: `year`, `month`, `day`, `hour` (unpadded), `ds`
    /// (`YYYY-MM-DD`) and `ts` (RFC 3339).
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
            out.push_str(&self.placeholder(&after[..close])?);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn placeholder(&self, name: &str) -> Result<String, TemplateError> {
        let start = self.window_start;
        let value = match name.trim() {
            "year" => start.year().to_string(),
            "month" => start.month().to_string(),
            "day" => start.day().to_string(),
            "hour" => start.hour().to_string(),
            "ds" => start.format("%Y-%m-%d").to_string(),
            "ts" => start.to_rfc3339(),
            other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
        };
        Ok(value)
    }
}

/// Joins a bucket and an object key into an `s3://` URI, rejecting keys that
/// would escape the bucket or address an ambiguous path. A trailing `/` on the
/// key is kept so a directory prefix only matches whole segments.
pub fn object_uri(bucket: &str, key: &str) -> Result<String, TemplateError> {
    let bucket_ok = !bucket.is_empty()
        && bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !bucket_ok {
        return Err(TemplateError::InvalidBucket(bucket.to_string()));
    }

    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(format!("s3://{bucket}"));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        let unsafe_segment = segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.chars().any(|c| c.is_control() || c == '\'' || c == '\\');
        if unsafe_segment {
            return Err(TemplateError::UnsafeKey(key.to_string()));
        }
        segments.push(segment);
    }

    let directory = if key.ends_with('/') { "/" } else { "" };
    Ok(format!("s3://{bucket}/{}{directory}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> RunContext {
        let start = Utc.with_ymd_and_hms(2018, 11, 3, 7, 0, 0).unwrap();
        RunContext::new(
            start,
            start + Duration::hours(1),
            CredentialsRef::new("aws_credentials"),
        )
        .unwrap()
    }

    #[test]
    fn renders_window_placeholders() {
        let rendered = ctx().render("log_data/{year}/{month}").unwrap();
        assert_eq!(rendered, "log_data/2018/11");

        let rendered = ctx().render("events/{ds}/h={hour}/d={day}").unwrap();
        assert_eq!(rendered, "events/2018-11-03/h=7/d=3");
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        assert_eq!(ctx().render("song_data").unwrap(), "song_data");
    }

    #[test]
    fn unknown_placeholder_is_an_error_not_a_blank() {
        let err = ctx().render("log_data/{execution_date}").unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnknownPlaceholder("execution_date".to_string())
        );
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let err = ctx().render("log_data/{year").unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated(_)));
    }

    #[test]
    fn rejects_inverted_window() {
        let start = Utc.with_ymd_and_hms(2018, 11, 3, 7, 0, 0).unwrap();
        let err = RunContext::new(start, start - Duration::hours(1), CredentialsRef::new("x"))
            .unwrap_err();
        assert_eq!(err.start, start);
    }

    #[test]
    fn deserializing_checks_the_window() {
        let ctx: RunContext = serde_json::from_value(serde_json::json!({
            "window_start": "2018-11-03T07:00:00Z",
            "window_end": "2018-11-03T08:00:00Z",
            "credentials_ref": "aws_credentials",
        }))
        .unwrap();
        assert_eq!(ctx.credentials_ref().as_str(), "aws_credentials");

        let inverted = serde_json::from_value::<RunContext>(serde_json::json!({
            "window_start": "2018-11-03T08:00:00Z",
            "window_end": "2018-11-03T07:00:00Z",
            "credentials_ref": "aws_credentials",
        }));
        assert!(inverted.is_err());
    }

    #[test]
    fn hourly_window_truncates_to_the_hour() {
        let at = Utc.with_ymd_and_hms(2018, 11, 3, 7, 42, 13).unwrap();
        let ctx = RunContext::hourly(at, CredentialsRef::new("x"));
        assert_eq!(
            ctx.window_start(),
            Utc.with_ymd_and_hms(2018, 11, 3, 7, 0, 0).unwrap()
        );
        assert_eq!(
            ctx.window_end(),
            Utc.with_ymd_and_hms(2018, 11, 3, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn joins_bucket_and_key() {
        assert_eq!(
            object_uri("udacity-dend", "/log_data/2018/11").unwrap(),
            "s3://udacity-dend/log_data/2018/11"
        );
        assert_eq!(
            object_uri("udacity-dend", "log_data/2018/1/").unwrap(),
            "s3://udacity-dend/log_data/2018/1/"
        );
        assert_eq!(object_uri("udacity-dend", "").unwrap(), "s3://udacity-dend");
    }

    #[test]
    fn rejects_unsafe_keys_and_buckets() {
        assert!(matches!(
            object_uri("udacity-dend", "log_data/../secrets"),
            Err(TemplateError::UnsafeKey(_))
        ));
        assert!(matches!(
            object_uri("udacity-dend", "log_data//2018"),
            Err(TemplateError::UnsafeKey(_))
        ));
        assert!(matches!(
            object_uri("udacity-dend", "log'; DROP TABLE users; --"),
            Err(TemplateError::UnsafeKey(_))
        ));
        assert!(matches!(
            object_uri("Bad/Bucket", "x"),
            Err(TemplateError::InvalidBucket(_))
        ));
    }
}
