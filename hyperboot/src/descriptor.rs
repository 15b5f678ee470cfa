//! Domain descriptor rendering.
//!
//! The template is a libvirt domain document. Rendering rewrites exactly these
//! fields and leaves everything else as written:
//!
//! | Field                                     | Value                  |
//! |-------------------------------------------|------------------------|
//! | `name`                                    | instance name          |
//! | `memory`, `currentMemory`                 | flavor memory (KiB)    |
//! | `vcpu`                                    | flavor vcpu count      |
//! | `devices/disk[@type=file]/source@file`    | workspace disk image   |
//! | `devices/interface[@type=network]/mac@address` | reserved address  |
//!
//! Only the first file disk and the first network interface are rewritten.
//! Templates with several of either are not supported.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::errors::{ProvisionError, ProvisionResult, local_io};

/// Values substituted into the template.
#[derive(Debug, Clone)]
pub struct DescriptorParams<'a> {
    pub instance_name: &'a str,
    pub memory_kib: u64,
    pub vcpu: u32,
    pub disk_path: &'a Path,
    pub mac_address: &'a str,
}

/// A rendered descriptor, already persisted at `path`.
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    pub name: String,
    pub path: PathBuf,
    xml: String,
}

impl DomainDescriptor {
    pub fn xml(&self) -> &str {
        &self.xml
    }
}

/// Renders descriptors from a template parsed once at construction.
///
/// Each render works on its own clone of the parsed tree.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    template: Element,
}

impl DescriptorBuilder {
    /// Parse and validate a template.
    ///
    /// # Errors
    ///
    /// `TemplateMalformed` if the document does not parse or lacks any of the
    /// rewritten fields.
    pub fn parse(template: &str) -> ProvisionResult<Self> {
        let root = Element::parse(template.as_bytes())
            .map_err(|e| ProvisionError::TemplateMalformed(format!("not valid XML: {}", e)))?;

        // Dry run so a broken template fails at startup, not mid-boot.
        let mut probe = root.clone();
        apply(
            &mut probe,
            &DescriptorParams {
                instance_name: "probe",
                memory_kib: 0,
                vcpu: 0,
                disk_path: Path::new("/probe.img"),
                mac_address: "00:00:00:00:00:00",
            },
        )?;

        Ok(Self { template: root })
    }

    pub fn from_file(path: &Path) -> ProvisionResult<Self> {
        let template = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::TemplateMalformed(format!(
                "Failed to read template {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&template)
    }

    /// Render the descriptor and durably write it to `dest`.
    ///
    /// The file is written next to `dest`, fsynced, then renamed into place.
    pub async fn render(
        &self,
        params: &DescriptorParams<'_>,
        dest: &Path,
    ) -> ProvisionResult<DomainDescriptor> {
        let xml = self.render_to_string(params)?;

        let mut tmp_name = dest.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| local_io("create", &tmp, e))?;
        file.write_all(xml.as_bytes())
            .await
            .map_err(|e| local_io("write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| local_io("sync", &tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| local_io("rename into place", dest, e))?;

        tracing::debug!(
            instance = %params.instance_name,
            path = %dest.display(),
            "Wrote domain descriptor"
        );

        Ok(DomainDescriptor {
            name: params.instance_name.to_string(),
            path: dest.to_path_buf(),
            xml,
        })
    }

    fn render_to_string(&self, params: &DescriptorParams<'_>) -> ProvisionResult<String> {
        let mut root = self.template.clone();
        apply(&mut root, params)?;

        let mut out = Vec::new();
        root.write_with_config(&mut out, EmitterConfig::new().perform_indent(true))
            .map_err(|e| ProvisionError::Internal(format!("Failed to serialize descriptor: {}", e)))?;
        String::from_utf8(out)
            .map_err(|e| ProvisionError::Internal(format!("descriptor is not UTF-8: {}", e)))
    }
}

fn apply(root: &mut Element, params: &DescriptorParams<'_>) -> ProvisionResult<()> {
    let memory = params.memory_kib.to_string();

    set_text(root, "name", params.instance_name)?;
    set_text(root, "memory", &memory)?;
    // No separate balloon target is modeled.
    set_text(root, "currentMemory", &memory)?;
    set_text(root, "vcpu", &params.vcpu.to_string())?;

    let devices = root
        .get_mut_child("devices")
        .ok_or_else(|| missing("devices"))?;

    let disk_file = params.disk_path.to_string_lossy().into_owned();
    first_typed_child(devices, "disk", "file")
        .ok_or_else(|| missing("devices/disk[@type=file]"))?
        .get_mut_child("source")
        .ok_or_else(|| missing("devices/disk[@type=file]/source"))?
        .attributes
        .insert("file".to_string(), disk_file);

    first_typed_child(devices, "interface", "network")
        .ok_or_else(|| missing("devices/interface[@type=network]"))?
        .get_mut_child("mac")
        .ok_or_else(|| missing("devices/interface[@type=network]/mac"))?
        .attributes
        .insert("address".to_string(), params.mac_address.to_string());

    Ok(())
}

fn set_text(root: &mut Element, name: &str, value: &str) -> ProvisionResult<()> {
    let element = root.get_mut_child(name).ok_or_else(|| missing(name))?;
    element.children = vec![XMLNode::Text(value.to_string())];
    Ok(())
}

fn first_typed_child<'a>(
    parent: &'a mut Element,
    name: &str,
    kind: &str,
) -> Option<&'a mut Element> {
    parent.children.iter_mut().find_map(|node| match node {
        XMLNode::Element(e)
            if e.name == name && e.attributes.get("type").map(String::as_str) == Some(kind) =>
        {
            Some(e)
        }
        _ => None,
    })
}

fn missing(path: &str) -> ProvisionError {
    ProvisionError::TemplateMalformed(format!("missing element {}", path))
}
