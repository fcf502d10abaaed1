//! The multipart/form-data envelope wrapped around every relayed upload.
//!
//! The endpoint needs a Content-Length, so the body is one form part:
//!
//! ```text
//! --<BOUNDARY>\r\n
//! Content-Disposition: form-data; name="<account>"; filename="<file>"\r\n
//! Content-Type: application/octet-stream\r\n
//! \r\n
//! <uploaded bytes>\r\n
//! --<BOUNDARY>--\r\n
//! ```

pub const BOUNDARY: &str = "----------ThIs_Is_tHe_bouNdaRY_$";

const CRLF: &str = "\r\n";

/// Value of the request's Content-Type header.
pub fn content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

/// Everything that precedes the payload.
pub fn preamble(field: &str, filename: &str) -> Vec<u8> {
    format!(
        "--{BOUNDARY}{CRLF}\
         Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"{CRLF}\
         Content-Type: application/octet-stream{CRLF}\
         {CRLF}",
        quote(field),
        quote(filename),
    )
    .into_bytes()
}

/// Everything that follows the payload.
pub fn closing() -> Vec<u8> {
    format!("{CRLF}--{BOUNDARY}--{CRLF}").into_bytes()
}

/// Keep header parameters on one line and inside their quotes.
fn quote(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_layout() {
        let text = String::from_utf8(preamble("alice", "report.csv")).unwrap();
        assert_eq!(
            text,
            "------------ThIs_Is_tHe_bouNdaRY_$\r\n\
             Content-Disposition: form-data; name=\"alice\"; filename=\"report.csv\"\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_closing_layout() {
        assert_eq!(closing(), b"\r\n------------ThIs_Is_tHe_bouNdaRY_$--\r\n".to_vec());
    }

    #[test]
    fn test_content_type_names_boundary() {
        assert_eq!(
            content_type(),
            "multipart/form-data; boundary=----------ThIs_Is_tHe_bouNdaRY_$"
        );
    }

    #[test]
    fn test_quotes_in_filename_are_escaped() {
        let text = String::from_utf8(preamble("bob", "a\"b.txt")).unwrap();
        assert!(text.contains("filename=\"a%22b.txt\""));
    }
}
