use super::ComposeFile;
use crate::config::FleetConfig;
use crate::domain::InstanceName;
use crate::error::FleetError;

/// Instance-specific values substituted into a template.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub name: &'a InstanceName,
    pub port: u16,
    pub image: Option<&'a str>,
    pub tag: Option<&'a str>,
    pub mail_relay: Option<&'a str>,
    /// `(default namespace, custom namespace)`
    pub repository: Option<(&'a str, &'a str)>,
}

/// Reject image overrides that smuggle a tag or digest into the name.
pub fn validate_image_name(image: &str) -> anyhow::Result<()> {
    let last = image.rsplit('/').next().unwrap_or(image);
    if image.is_empty() || last.contains(':') || image.contains('@') {
        return Err(FleetError::configuration(format!(
            "invalid image name {image:?}: pass the tag separately"
        ))
        .into());
    }
    Ok(())
}

/// Produce a concrete instance config from a template. The template itself is
/// left untouched; port lookups always read the template.
pub fn render(
    template: &ComposeFile,
    cfg: &FleetConfig,
    ctx: &RenderContext<'_>,
) -> anyhow::Result<ComposeFile> {
    if let Some(image) = ctx.image {
        validate_image_name(image)?;
    }
    let mut doc = template.clone();

    let app = doc.service_mut(&cfg.app_service).ok_or_else(|| {
        FleetError::malformed(format!("no `{}` service in template", cfg.app_service))
    })?;
    app.set_image(ctx.image, ctx.tag)?;

    let public = template
        .service(&cfg.proxy_service)
        .ok_or_else(|| {
            FleetError::malformed(format!("no `{}` service in template", cfg.proxy_service))
        })?
        .ports
        .iter()
        .find(|p| p.container_port() == Some(80))
        .ok_or_else(|| {
            FleetError::malformed(format!(
                "`{}` service publishes no port 80 mapping",
                cfg.proxy_service
            ))
        })?
        .with_published(ctx.port);
    for svc in doc.services.values_mut() {
        svc.ports.clear();
    }
    if let Some(proxy) = doc.service_mut(&cfg.proxy_service) {
        proxy.ports.push(public);
    }

    if let Some(app) = doc.service_mut(&cfg.app_service) {
        app.hostname = Some(ctx.name.to_string());
    }

    if let Some(relay) = ctx.mail_relay {
        let mail = doc.service_mut(&cfg.mail_service).ok_or_else(|| {
            FleetError::malformed(format!(
                "mail relay configured but template has no `{}` service",
                cfg.mail_service
            ))
        })?;
        mail.environment.set("RELAYHOST", relay);
    }

    if let Some((default_ns, custom_ns)) = ctx.repository {
        let prefix = format!("{}/", default_ns.trim_end_matches('/'));
        let custom = custom_ns.trim_end_matches('/');
        for svc in doc.services.values_mut() {
            if let Some(rest) = svc.image.as_deref().and_then(|i| i.strip_prefix(&prefix)) {
                svc.image = Some(format!("{custom}/{rest}"));
            }
        }
    }

    Ok(doc)
}
