use crate::error::ArchivistErrorCode;

pub struct WarnEvent<'a> {
    pub code: ArchivistErrorCode,
    pub stage: &'a str,
    pub action: &'a str,
    pub key: &'a str,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn format_line(event: &WarnEvent<'_>) -> String {
    format!(
        "ARCHIVIST_WARN code={} stage={} action={} key={} retry={} reason={} err={}",
        event.code.as_str(),
        sanitize_value(event.stage),
        sanitize_value(event.action),
        sanitize_value(event.key),
        sanitize_value(event.retry),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

pub fn emit(event: WarnEvent<'_>) {
    eprintln!("{}", format_line(&event));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn sanitize_value_falls_back_for_empty() {
        assert_eq!(sanitize_value("   "), "na");
    }

    #[test]
    fn line_carries_stable_code() {
        let line = format_line(&WarnEvent {
            code: ArchivistErrorCode::E006UploadFailed,
            stage: "ctf",
            action: "create-record",
            key: "FoilHole_1_Data_2_3_20240101_120000",
            retry: "next-tick",
            reason: "attempts-exhausted",
            err: "connection refused",
        });
        assert!(line.starts_with("ARCHIVIST_WARN code=E006_UPLOAD_FAILED stage=ctf"));
        assert!(line.ends_with("err=connection_refused"));
    }
}
