#[cfg(feature = "pdf")]
use tracing::warn;
use tracing::debug;

/// Text layer of a PDF primary document, or `None` when it cannot be read.
#[cfg(feature = "pdf")]
pub fn pdf_text(bytes: &[u8]) -> Option<String> {
    if !bytes.starts_with(b"%PDF") {
        debug!(len = bytes.len(), "primary document is not a PDF");
        return None;
    }
    // The extractor panics on some malformed font tables.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
        Ok(Ok(_)) => {
            debug!("pdf has no text layer");
            None
        }
        Ok(Err(error)) => {
            warn!(%error, "pdf text extraction failed");
            None
        }
        Err(_) => {
            warn!("pdf text extraction panicked");
            None
        }
    }
}

#[cfg(not(feature = "pdf"))]
pub fn pdf_text(bytes: &[u8]) -> Option<String> {
    debug!(len = bytes.len(), "pdf support disabled at build time");
    None
}

#[cfg(test)]
mod tests {
    use super::pdf_text;

    #[test]
    fn non_pdf_bytes_yield_nothing() {
        assert_eq!(pdf_text(b"<html>not a pdf</html>"), None);
        assert_eq!(pdf_text(b"%PDF-1.4\n%garbage without objects"), None);
    }
}
