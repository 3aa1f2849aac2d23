use super::ExtractionError;
use std::panic::{self, AssertUnwindSafe};

/// Extract text from a PDF.
///
/// The PDF reader panics on some malformed inputs; those panics become extraction failures.
pub(super) fn extract(bytes: &[u8]) -> Result<String, ExtractionError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));
    match outcome {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(ExtractionError::failed(format!("unreadable PDF: {err}"))),
        Err(_) => Err(ExtractionError::failed("PDF reader aborted on malformed input")),
    }
}
