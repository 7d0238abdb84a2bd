//! Image lookup and candidate computation.
//!
//! `get_image` tries the local registry first and falls through to the
//! remote update registry on not-found only; any other error propagates.
//! `candidates` computes the images eligible to replace a service's
//! current image. The returned list is deliberately unsorted: callers
//! order and pick.

use uuid::Uuid;

use dcadm_types::{DcadmError, Image, Instance};

use crate::api::ImgapiClient;

/// Version pattern constraining update-registry listings.
pub const CANDIDATE_VERSION_PATTERN: &str = "~master";

/// Image name in the update registry for each updatable service. Services
/// absent from this table have no candidates.
pub const IMAGE_NAMES: &[(&str, &str)] = &[
    ("adminui", "adminui"),
    ("agents_core", "agents_core"),
    ("amon", "amon"),
    ("amon-agent", "amon-agent"),
    ("assets", "assets"),
    ("binder", "binder"),
    ("cn-agent", "cn-agent"),
    ("cnapi", "cnapi"),
    ("config-agent", "config-agent"),
    ("dhcpd", "dhcpd"),
    ("firewaller", "firewaller"),
    ("fwapi", "fwapi"),
    ("imgapi", "imgapi"),
    ("mahi", "mahi"),
    ("manatee", "sdc-manatee"),
    ("moray", "moray"),
    ("napi", "napi"),
    ("net-agent", "net-agent"),
    ("papi", "papi"),
    ("rabbitmq", "rabbitmq"),
    ("sapi", "sapi"),
    ("sdc", "sdc"),
    ("smartlogin", "smartlogin"),
    ("ufds", "ufds"),
    ("vm-agent", "vm-agent"),
    ("vmapi", "vmapi"),
    ("wfapi", "workflow"),
];

pub fn image_name_for_service(service: &str) -> Option<&'static str> {
    IMAGE_NAMES
        .iter()
        .find(|(name, _)| *name == service)
        .map(|(_, image)| *image)
}

#[derive(Debug, Clone)]
pub struct Catalog {
    local: ImgapiClient,
    updates: ImgapiClient,
}

impl Catalog {
    pub fn new(local: ImgapiClient, updates: ImgapiClient) -> Self {
        Self { local, updates }
    }

    /// One image by uuid: local registry first, update registry on
    /// not-found, any other error propagated.
    pub fn get_image(&self, uuid: Uuid) -> Result<Image, DcadmError> {
        if let Some(image) = self.local.get_image_opt(uuid)? {
            return Ok(image);
        }
        self.updates.get_image(uuid)
    }

    /// Like [`get_image`] but unknown-everywhere is `None` rather than an
    /// error; used when collecting in-use images whose origin may predate
    /// the registries.
    ///
    /// [`get_image`]: Catalog::get_image
    fn get_image_either(&self, uuid: Uuid) -> Result<Option<Image>, DcadmError> {
        if let Some(image) = self.local.get_image_opt(uuid)? {
            return Ok(Some(image));
        }
        self.updates.get_image_opt(uuid)
    }

    /// Candidate images for a service given its current instances.
    pub fn candidates(
        &self,
        service_name: &str,
        current_instances: &[&Instance],
    ) -> Result<Vec<Image>, DcadmError> {
        let Some(image_name) = image_name_for_service(service_name) else {
            return Ok(Vec::new());
        };

        let mut in_use_uuids: Vec<Uuid> = current_instances.iter().filter_map(|i| i.image).collect();
        in_use_uuids.sort();
        in_use_uuids.dedup();

        // Fan out the in-use lookups; the set is bounded by the number of
        // distinct images, typically single digits.
        let mut in_use: Vec<Image> = Vec::with_capacity(in_use_uuids.len());
        let results: Vec<Result<Option<Image>, DcadmError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = in_use_uuids
                .iter()
                .map(|uuid| {
                    let uuid = *uuid;
                    scope.spawn(move || self.get_image_either(uuid))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(DcadmError::internal("image lookup panicked")))
                })
                .collect()
        });
        for result in results {
            if let Some(image) = result? {
                in_use.push(image);
            }
        }

        let listed = self
            .updates
            .list_images(image_name, Some(CANDIDATE_VERSION_PATTERN))?;

        Ok(filter_candidates(&in_use, listed))
    }
}

/// Drop candidates published before the oldest in-use image, and the
/// oldest in-use image itself (a no-op update). Order is preserved.
fn filter_candidates(in_use: &[Image], listed: Vec<Image>) -> Vec<Image> {
    let Some(oldest) = in_use.iter().min_by_key(|i| i.published_at) else {
        return listed;
    };

    listed
        .into_iter()
        .filter(|candidate| {
            candidate.published_at >= oldest.published_at && candidate.uuid != oldest.uuid
        })
        .collect()
}
