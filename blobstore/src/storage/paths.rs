// path_for maps logical path specs to driver paths.
// The layout is internal to the storage system and nothing else builds paths.
//
// The path layout in the storage backend is roughly as follows:
//
//	/v2
//	├── blobs
//	│   └── <algorithm>
//	│       └── <first two hex bytes of digest>
//	│           └── <hex digest>
//	│               └── data
//	└── repositories
//	    └── <name>
//	        ├── _layers
//	        │   └── <algorithm>
//	        │       └── <hex digest>
//	        │           └── link
//	        ├── _manifests
//	        │   └── revisions
//	        │       └── <algorithm>
//	        │           └── <hex digest>
//	        │               └── link
//	        └── _uploads
//	            └── <id>
//	                ├── data
//	                ├── startedat
//	                └── hashstates
//	                    └── <algorithm>
//	                        └── <offset>
//
// The storage backend layout is broken up into a content-addressable blob
// store and repositories. The content-addressable blob store holds most data
// throughout the backend, keyed by algorithm and digests of the underlying
// content. Access to the blob store is controlled through links from the
// repository to blobstore. Every path under a repository's `_uploads`
// directory belongs to an upload session and nothing else lives there.

use oci_spec::image::{Digest, DigestAlgorithm};

use crate::error::StorageError;
use crate::utils::validation::{is_valid_name, is_valid_upload_id};

pub const STORAGE_ROOT: &str = "/v2";

/// Directory segment that marks upload session trees.
pub const UPLOADS_SEGMENT: &str = "_uploads";

pub const LINK_FILE: &str = "link";
pub const UPLOAD_DATA_FILE: &str = "data";
pub const UPLOAD_STARTED_AT_FILE: &str = "startedat";

#[derive(Clone, Copy, Debug)]
pub enum PathSpec<'a> {
    /// `/v2/repositories`
    Repositories,
    /// `/v2/blobs/<alg>/<hex[..2]>/<hex>/data`
    BlobData { digest: &'a Digest },
    /// `/v2/repositories/<name>/_layers`
    LayersRoot { name: &'a str },
    /// `/v2/repositories/<name>/_layers/<alg>/<hex>/link`
    LayerLink { name: &'a str, digest: &'a Digest },
    /// `/v2/repositories/<name>/_manifests/revisions`
    ManifestRevisionsRoot { name: &'a str },
    /// `/v2/repositories/<name>/_manifests/revisions/<alg>/<hex>/link`
    ManifestRevisionLink { name: &'a str, revision: &'a Digest },
    /// `/v2/repositories/<name>/_uploads/<id>`
    Upload { name: &'a str, id: &'a str },
    /// `/v2/repositories/<name>/_uploads/<id>/data`
    UploadData { name: &'a str, id: &'a str },
    /// `/v2/repositories/<name>/_uploads/<id>/startedat`
    UploadStartedAt { name: &'a str, id: &'a str },
    /// `/v2/repositories/<name>/_uploads/<id>/hashstates/<alg>/<offset>`
    UploadHashState {
        name: &'a str,
        id: &'a str,
        algorithm: &'a DigestAlgorithm,
        offset: u64,
    },
}

pub fn path_for(spec: &PathSpec<'_>) -> Result<String, StorageError> {
    let repositories = format!("{STORAGE_ROOT}/repositories");
    let path = match *spec {
        PathSpec::Repositories => repositories,
        PathSpec::BlobData { digest } => {
            let (algorithm, hex) = digest_components(digest)?;
            let prefix = hex
                .get(..2)
                .ok_or_else(|| StorageError::InvalidPath(format!("digest too short: {digest}")))?;
            format!("{STORAGE_ROOT}/blobs/{algorithm}/{prefix}/{hex}/data")
        }
        PathSpec::LayersRoot { name } => {
            format!("{}/_layers", repository_path(&repositories, name)?)
        }
        PathSpec::LayerLink { name, digest } => {
            let (algorithm, hex) = digest_components(digest)?;
            format!(
                "{}/_layers/{algorithm}/{hex}/{LINK_FILE}",
                repository_path(&repositories, name)?
            )
        }
        PathSpec::ManifestRevisionsRoot { name } => {
            format!("{}/_manifests/revisions", repository_path(&repositories, name)?)
        }
        PathSpec::ManifestRevisionLink { name, revision } => {
            let (algorithm, hex) = digest_components(revision)?;
            format!(
                "{}/_manifests/revisions/{algorithm}/{hex}/{LINK_FILE}",
                repository_path(&repositories, name)?
            )
        }
        PathSpec::Upload { name, id } => upload_path(&repositories, name, id)?,
        PathSpec::UploadData { name, id } => {
            format!("{}/{UPLOAD_DATA_FILE}", upload_path(&repositories, name, id)?)
        }
        PathSpec::UploadStartedAt { name, id } => {
            format!(
                "{}/{UPLOAD_STARTED_AT_FILE}",
                upload_path(&repositories, name, id)?
            )
        }
        PathSpec::UploadHashState {
            name,
            id,
            algorithm,
            offset,
        } => format!(
            "{}/hashstates/{algorithm}/{offset}",
            upload_path(&repositories, name, id)?
        ),
    };
    Ok(path)
}

fn repository_path(repositories: &str, name: &str) -> Result<String, StorageError> {
    if !is_valid_name(name) {
        return Err(StorageError::NameInvalid(name.to_string()));
    }
    Ok(format!("{repositories}/{name}"))
}

fn upload_path(repositories: &str, name: &str, id: &str) -> Result<String, StorageError> {
    if !is_valid_upload_id(id) {
        return Err(StorageError::InvalidPath(format!("invalid upload id {id:?}")));
    }
    Ok(format!(
        "{}/{UPLOADS_SEGMENT}/{id}",
        repository_path(repositories, name)?
    ))
}

fn digest_components(digest: &Digest) -> Result<(String, &str), StorageError> {
    let hex = digest.digest();
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StorageError::DigestInvalid(digest.to_string()));
    }
    Ok((digest.algorithm().to_string(), hex))
}
