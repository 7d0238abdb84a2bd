//! Image-registry client, used for both the local registry and the remote
//! update registry: the two speak the same API and differ only in base URL
//! and upstream tag.

use std::path::Path;

use reqwest::blocking::Client;
use serde::Serialize;
use uuid::Uuid;

use dcadm_types::{DcadmError, Image, Upstream};

use super::Endpoint;

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Clone)]
pub struct ImgapiClient {
    ep: Endpoint,
}

impl ImgapiClient {
    pub fn new(http: Client, base: &str, upstream: Upstream) -> Self {
        Self {
            ep: Endpoint::new(http, base, upstream),
        }
    }

    pub fn upstream(&self) -> Upstream {
        self.ep.upstream()
    }

    pub fn get_image(&self, uuid: Uuid) -> Result<Image, DcadmError> {
        self.ep
            .get_json(&format!("/images/{uuid}"), &[], "get image")
    }

    /// Like [`get_image`] but maps 404 to `None` for fall-through lookups.
    ///
    /// [`get_image`]: ImgapiClient::get_image
    pub fn get_image_opt(&self, uuid: Uuid) -> Result<Option<Image>, DcadmError> {
        self.ep
            .get_json_opt(&format!("/images/{uuid}"), "get image")
    }

    /// List images by name, optionally constrained by a version pattern
    /// such as `~master`.
    pub fn list_images(
        &self,
        name: &str,
        version_pattern: Option<&str>,
    ) -> Result<Vec<Image>, DcadmError> {
        let mut query: Vec<(&str, String)> = vec![("name", name.to_string())];
        if let Some(pattern) = version_pattern {
            query.push(("version", pattern.to_string()));
        }
        self.ep.get_json("/images", &query, "list images")
    }

    /// Ask this registry to pull one image from `source`.
    pub fn import_from(&self, uuid: Uuid, source: &str) -> Result<Image, DcadmError> {
        self.ep.post_json(
            &format!("/images/{uuid}?action=import-remote&source={source}"),
            &Empty {},
            "import image",
        )
    }

    /// Download the image file to `dest`, returning the byte count.
    pub fn download_file(&self, uuid: Uuid, dest: &Path) -> Result<u64, DcadmError> {
        self.ep
            .download(&format!("/images/{uuid}/file"), dest, "download image file")
    }
}
