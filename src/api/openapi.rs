use super::handlers::{auth, health};
use utoipa::openapi::{
    Components, Contact, InfoBuilder, License, OpenApiBuilder, Tag,
    security::{Http, HttpAuthScheme, SecurityScheme},
};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Routes added outside (like `/` or `/docs`) are not documented.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads each handler's #[utoipa::path] for its method, path and schema.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(auth::register::register))
        .routes(routes!(auth::verify_email::verify_email))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::refresh::refresh))
        .routes(routes!(auth::logout::logout))
        .routes(routes!(auth::check_username::check_username))
        .routes(routes!(auth::saved_accounts::saved_accounts))
        .routes(routes!(auth::saved_accounts::delete_saved_account))
        .routes(routes!(auth::oauth::oauth))
        .routes(routes!(auth::two_fa::status))
        .routes(routes!(auth::two_fa::totp::register))
        .routes(routes!(auth::two_fa::totp::verify))
        .routes(routes!(auth::two_fa::totp::login))
        .routes(routes!(auth::two_fa::totp::delete))
        .routes(routes!(auth::two_fa::webauthn::register_options))
        .routes(routes!(auth::two_fa::webauthn::register_verify))
        .routes(routes!(auth::two_fa::webauthn::login_options))
        .routes(routes!(auth::two_fa::webauthn::login_verify))
        .routes(routes!(auth::two_fa::webauthn::delete));

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Sign-in, session rotation and saved accounts".to_string());

    let mut two_fa_tag = Tag::new("two-fa");
    two_fa_tag.description = Some("Authenticator app and WebAuthn second factors".to_string());

    let openapi = router.get_openapi_mut();
    openapi.tags = Some(vec![auth_tag, two_fa_tag]);
    openapi
        .components
        .get_or_insert_with(Components::default)
        .add_security_scheme(
            "bearer",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(':').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (optional_str(name), optional_str(email.trim_end_matches('>'))),
        None => (optional_str(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let doc = openapi();
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(doc.info.version, env!("CARGO_PKG_VERSION"));

        let contact = doc.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Quillgate"));
            assert_eq!(contact.email.as_deref(), Some("team@quillgate.dev"));
        }

        let license = doc.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
        }
    }

    #[test]
    fn openapi_tags_and_paths() {
        let doc = openapi();
        let tags = doc.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        assert!(tags.iter().any(|tag| tag.name == "two-fa"));
        for path in [
            "/auth/refresh",
            "/auth/saved-accounts/{username}",
            "/auth/two-fa/webauthn/login/verify",
            "/auth/oauth/{provider}",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn parse_author_variants() {
        assert_eq!(
            parse_author("Team Quillgate <team@quillgate.dev>"),
            (Some("Team Quillgate"), Some("team@quillgate.dev"))
        );
        assert_eq!(parse_author("Solo"), (Some("Solo"), None));
        assert_eq!(parse_author("<a@b.c>"), (None, Some("a@b.c")));
    }
}
