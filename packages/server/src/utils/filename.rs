pub const PDF_MIME: &str = "application/pdf";

/// Reason an uploaded file name was rejected.
#[derive(Debug)]
pub enum FilenameError {
    /// Filename is empty or whitespace-only.
    Empty,
    /// Filename exceeds 255 characters.
    TooLong,
    /// Filename contains null bytes.
    NullByte,
    /// Filename contains control characters (CR, LF, etc.).
    ControlCharacter,
}

impl FilenameError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "Filename cannot be empty",
            Self::TooLong => "Filename must be at most 255 characters",
            Self::NullByte => "Invalid filename: null bytes are not allowed",
            Self::ControlCharacter => "Invalid filename: control characters are not allowed",
        }
    }
}

/// Reduce a client-supplied upload name to its final path component.
///
/// Browsers on some platforms send full paths (`C:\Users\me\scan.pdf`).
pub fn sanitize_upload_name(filename: &str) -> Result<String, FilenameError> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(FilenameError::Empty);
    }

    if base.contains('\0') {
        return Err(FilenameError::NullByte);
    }

    // Rejected to prevent header injection through Content-Disposition.
    if base.chars().any(|c| c.is_control()) {
        return Err(FilenameError::ControlCharacter);
    }

    if base.chars().count() > 255 {
        return Err(FilenameError::TooLong);
    }

    Ok(base.to_string())
}

/// An upload is accepted when it is declared as a PDF or named like one.
pub fn is_pdf_upload(content_type: Option<&str>, filename: Option<&str>) -> bool {
    let declared_pdf = content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(PDF_MIME));

    let named_pdf = filename.is_some_and(|name| name.trim().to_ascii_lowercase().ends_with(".pdf"));

    declared_pdf || named_pdf
}

/// Build a safe `Content-Disposition` header value.
pub fn content_disposition_value(filename: &str) -> String {
    let ascii_safe: String = filename
        .chars()
        .filter(|c| (c.is_ascii_graphic() || *c == ' ') && !matches!(c, '"' | ';' | '\\'))
        .collect();
    let ascii_name = if ascii_safe.trim().is_empty() {
        "receipt.pdf".to_string()
    } else {
        ascii_safe
    };

    // RFC 5987 percent-encoding for filename*.
    let encoded: String = filename
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect();

    format!("inline; filename=\"{ascii_name}\"; filename*=UTF-8''{encoded}")
}
