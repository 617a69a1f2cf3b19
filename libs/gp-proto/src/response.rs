//! Classification of gateway replies.
//!
//! A GlobalProtect gateway answers in one of three shapes: an XML document,
//! the JavaScript-ish challenge blob, or a raw error body. The classifier
//! resolves the shape and either maps error documents onto typed errors or
//! hands the XML root to a caller-supplied callback.

use crate::challenge::{self, ScriptResponse};

/// Error surface of the HTTPS request collaborator.
///
/// The gateway signals some failures at the HTTP layer before any body is
/// worth inspecting; those arrive as the first two variants.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid username or password")]
    AccessDenied,
    #[error("invalid client certificate")]
    BadClientCertificate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid client certificate")]
    InvalidClientCert,
    #[error("empty response from server")]
    EmptyResponse,
    #[error("failed to parse server response")]
    MalformedResponse,
    #[error("gateway requires further input: {prompt}")]
    ChallengeRequired { prompt: String, input_str: String },
    #[error("GlobalProtect gateway or portal does not exist")]
    NoSuchGateway,
    #[error("invalid authentication cookie")]
    AuthCookieInvalid,
    #[error("{0}")]
    ServerError(String),
    #[error(transparent)]
    Http(HttpError),
}

const ERR_NO_GATEWAY: &str = "GlobalProtect gateway does not exist";
const ERR_NO_PORTAL: &str = "GlobalProtect portal does not exist";
const ERR_BAD_COOKIE: &str = "Invalid authentication cookie";

/// Interprets the HTTPS collaborator's reply to a gateway request.
///
/// `on_xml` receives the document root of any XML reply that is not the
/// `<response status="error">` error form.
pub fn interpret<T>(
    result: Result<String, HttpError>,
    on_xml: impl FnOnce(roxmltree::Node<'_, '_>) -> Result<T, ResponseError>,
) -> Result<T, ResponseError> {
    let body = match result {
        Ok(body) => body,
        Err(HttpError::AccessDenied) => {
            tracing::error!("Invalid username or password");
            return Err(ResponseError::InvalidCredentials);
        }
        Err(HttpError::BadClientCertificate) => {
            tracing::error!("Invalid client certificate");
            return Err(ResponseError::InvalidClientCert);
        }
        Err(e) => return Err(ResponseError::Http(e)),
    };

    if body.is_empty() {
        tracing::debug!("Empty response from server");
        return Err(ResponseError::EmptyResponse);
    }

    let doc = match roxmltree::Document::parse(&body) {
        Ok(doc) => doc,
        Err(_) => return Err(interpret_non_xml(&body)),
    };

    let root = doc.root_element();

    if root.has_tag_name("response") && root.attribute("status") == Some("error") {
        let Some(message) = root
            .children()
            .find(|n| n.has_tag_name("error"))
            .and_then(|n| n.text())
        else {
            return Err(malformed(&body));
        };

        return Err(classify_error_message(message));
    }

    on_xml(root).map_err(|e| match e {
        ResponseError::MalformedResponse => malformed(&body),
        other => other,
    })
}

fn interpret_non_xml(body: &str) -> ResponseError {
    match challenge::parse(body) {
        Ok(ScriptResponse::Challenge { prompt, input_str }) => {
            tracing::info!("Challenge: {prompt}");

            ResponseError::ChallengeRequired { prompt, input_str }
        }
        Ok(ScriptResponse::Error { message }) => {
            tracing::error!("{message}");

            ResponseError::ServerError(message)
        }
        Err(_) => malformed(body),
    }
}

fn malformed(body: &str) -> ResponseError {
    tracing::error!("Failed to parse server response");
    tracing::debug!("Response was: {body}");

    ResponseError::MalformedResponse
}

fn classify_error_message(message: &str) -> ResponseError {
    match message {
        ERR_NO_GATEWAY | ERR_NO_PORTAL => {
            tracing::debug!("{message}");

            ResponseError::NoSuchGateway
        }
        ERR_BAD_COOKIE => {
            tracing::error!("{message}");

            ResponseError::AuthCookieInvalid
        }
        other => {
            tracing::error!("{other}");

            ResponseError::ServerError(other.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_xml_expected(_: roxmltree::Node<'_, '_>) -> Result<(), ResponseError> {
        panic!("XML callback should not run")
    }

    #[test]
    fn maps_invalid_auth_cookie() {
        let body = r#"<response status="error"><error>Invalid authentication cookie</error></response>"#;

        let result = interpret(Ok(body.to_owned()), no_xml_expected);

        assert!(matches!(result, Err(ResponseError::AuthCookieInvalid)));
    }

    #[test]
    fn maps_missing_gateway_and_portal() {
        for sentinel in [
            "GlobalProtect gateway does not exist",
            "GlobalProtect portal does not exist",
        ] {
            let body = format!(r#"<response status="error"><error>{sentinel}</error></response>"#);

            let result = interpret(Ok(body), no_xml_expected);

            assert!(matches!(result, Err(ResponseError::NoSuchGateway)));
        }
    }

    #[test]
    fn maps_other_error_text_to_server_error() {
        let body = r#"<response status="error"><error>Assign private IP address failed</error></response>"#;

        let result = interpret(Ok(body.to_owned()), no_xml_expected);

        assert!(
            matches!(result, Err(ResponseError::ServerError(msg)) if msg == "Assign private IP address failed")
        );
    }

    #[test]
    fn error_response_without_error_child_is_malformed() {
        let body = r#"<response status="error"><status>down</status></response>"#;

        let result = interpret(Ok(body.to_owned()), no_xml_expected);

        assert!(matches!(result, Err(ResponseError::MalformedResponse)));
    }

    #[test]
    fn empty_body() {
        let result = interpret(Ok(String::new()), no_xml_expected);

        assert!(matches!(result, Err(ResponseError::EmptyResponse)));
    }

    #[test]
    fn challenge_script_surfaces_prompt_and_input() {
        let body = "var respStatus = \"Challenge\";\nvar respMsg = \"OTP?\";\nthisForm.inputStr.value = \"abc\";\n";

        let result = interpret(Ok(body.to_owned()), no_xml_expected);

        match result {
            Err(ResponseError::ChallengeRequired { prompt, input_str }) => {
                assert_eq!(prompt, "OTP?");
                assert_eq!(input_str, "abc");
            }
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn error_script_surfaces_message() {
        let body = "var respStatus = \"Error\";\nvar respMsg = \"Session expired\";\n";

        let result = interpret(Ok(body.to_owned()), no_xml_expected);

        assert!(matches!(result, Err(ResponseError::ServerError(msg)) if msg == "Session expired"));
    }

    #[test]
    fn garbage_is_malformed() {
        let result = interpret(Ok("HTTP/1.1 502 Bad Gateway".to_owned()), no_xml_expected);

        assert!(matches!(result, Err(ResponseError::MalformedResponse)));
    }

    #[test]
    fn http_sentinels_map_before_body_inspection() {
        let result = interpret(Err(HttpError::AccessDenied), no_xml_expected);
        assert!(matches!(result, Err(ResponseError::InvalidCredentials)));

        let result = interpret(Err(HttpError::BadClientCertificate), no_xml_expected);
        assert!(matches!(result, Err(ResponseError::InvalidClientCert)));
    }

    #[test]
    fn other_xml_roots_reach_the_callback() {
        let body = "<response><ip-address>10.0.0.2</ip-address></response>";

        let result = interpret(Ok(body.to_owned()), |root| {
            Ok(root
                .children()
                .find(|n| n.has_tag_name("ip-address"))
                .and_then(|n| n.text())
                .map(ToOwned::to_owned))
        });

        assert_eq!(result.unwrap(), Some("10.0.0.2".to_owned()));
    }
}
