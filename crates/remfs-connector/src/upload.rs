//! Upload form encoding
//!
//! Builds the multipart bodies for the three shapes of the `upload` command:
//!
//! - **Files** - one or more whole files as `upload[]` parts
//! - **Chunk** - one slice of a large file, named `name.{i}_{last}.part`,
//!   with the shared `cid` and the `range` (`offset,length,total`)
//! - **Merge** - the commit request carrying the merge token the server
//!   returned after the last chunk

use remfs_core::domain::{UploadFile, UploadPayload};
use remfs_core::ports::TransportError;
use reqwest::multipart::{Form, Part};

/// Multipart field carrying file contents
pub const UPLOAD_FIELD: &str = "upload[]";

fn file_part(file: &UploadFile, file_name: String) -> Result<Part, TransportError> {
    let part = Part::bytes(file.data.clone()).file_name(file_name);
    match &file.mime {
        Some(mime) => part
            .mime_str(mime)
            .map_err(|e| TransportError::InvalidResponse(format!("Invalid MIME type {mime}: {e}"))),
        None => Ok(part),
    }
}

fn overwrite_flag(overwrite: bool) -> &'static str {
    if overwrite {
        "1"
    } else {
        "0"
    }
}

/// Build the multipart body of an upload request
///
/// # Errors
/// Returns [`TransportError::InvalidResponse`] when a file carries a MIME
/// type that is not a valid media type; nothing is sent in that case.
pub fn build_form(payload: &UploadPayload) -> Result<Form, TransportError> {
    let form = Form::new()
        .text("cmd", "upload")
        .text("target", payload.target().to_string());

    let form = match payload {
        UploadPayload::Files {
            files, overwrite, ..
        } => {
            let mut form = form.text("overwrite", overwrite_flag(*overwrite));
            for file in files {
                form = form.part(UPLOAD_FIELD, file_part(file, file.name.clone())?);
            }
            form
        }
        UploadPayload::Chunk {
            file,
            chunk,
            overwrite,
            ..
        } => form
            .text("overwrite", overwrite_flag(*overwrite))
            .text("chunk", chunk.part_name(&file.name))
            .text("cid", chunk.cid.clone())
            .text("range", chunk.range_param())
            .part(UPLOAD_FIELD, file_part(file, file.name.clone())?),
        UploadPayload::Merge {
            token,
            name,
            overwrite,
            ..
        } => form
            .text("overwrite", overwrite_flag(*overwrite))
            .text("chunk", token.as_str().to_string())
            .text(UPLOAD_FIELD, token.as_str().to_string())
            .text("_name", name.clone()),
    };

    Ok(form)
}
