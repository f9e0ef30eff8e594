//! HTTP routes. Decoding and inference run on the blocking pool

use super::protocol::{self, HealthResponse, PredictResponse};
use super::{AppState, RequestError, WebError};
use crate::labels::Class;
use crate::preprocess::{self, ImageError};
use actix_multipart::Multipart;
use actix_web::{get, post, web, Responder};
use anyhow::anyhow;
use base64::{engine::general_purpose, Engine as _};
use futures_util::TryStreamExt;
use std::time::Instant;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, WebError>;

/// Multipart field carrying the image
pub const FILE_FIELD: &str = "file";

#[get("/")]
pub async fn root() -> impl Responder {
    web::Json(HealthResponse {
        message: protocol::HEALTH_MESSAGE.into(),
    })
}

/// Classify an image uploaded as `multipart/form-data`
#[post("/predict")]
pub async fn predict(mut payload: Multipart, state: web::Data<AppState>) -> Result<impl Responder> {
    let bytes = read_upload(&mut payload, state.max_upload_bytes).await?;
    let classes = classify(state, bytes, Declared::default()).await?;
    Ok(web::Json(PredictResponse::from(classes)))
}

/// Classify an image sent as base 64 inside a JSON body
#[post("/predict/base64")]
pub async fn predict_base64(
    req: web::Json<protocol::B64Image>,
    state: web::Data<AppState>,
) -> Result<impl Responder> {
    debug!("got base64 request {:?}", req);
    let bytes = general_purpose::STANDARD
        .decode(req.image.trim())
        .map_err(RequestError::from)?;
    let declared = Declared {
        width: req.width,
        height: req.height,
    };
    let classes = classify(state, bytes, declared).await?;
    Ok(web::Json(PredictResponse::from(classes)))
}

/// Describe the loaded model
#[get("/model")]
pub async fn model_info(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.classifier.info().clone())
}

/// Read the `file` field of a multipart body. If there is no field of that
/// name, the first field carrying a filename is used instead
async fn read_upload(payload: &mut Multipart, limit: usize) -> Result<Vec<u8>> {
    let mut fallback = None;

    while let Some(mut field) = payload.try_next().await.map_err(multipart_error)? {
        let named = field.name() == FILE_FIELD;
        let has_filename = field.content_disposition().get_filename().is_some();

        if !named && (fallback.is_some() || !has_filename) {
            while field.try_next().await.map_err(multipart_error)?.is_some() {}
            continue;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(multipart_error)? {
            if bytes.len() + chunk.len() > limit {
                return Err(ImageError::TooLarge(bytes.len() + chunk.len(), limit).into());
            }
            bytes.extend_from_slice(&chunk);
        }

        if named {
            return Ok(bytes);
        }
        debug!("no \"{FILE_FIELD}\" field yet, keeping \"{}\"", field.name());
        fallback = Some(bytes);
    }

    fallback.ok_or_else(|| RequestError::MissingFile.into())
}

fn multipart_error(err: actix_multipart::MultipartError) -> WebError {
    RequestError::Multipart(err.to_string()).into()
}

/// Dimensions a client stated for its image
#[derive(Debug, Default, Clone, Copy)]
struct Declared {
    width: Option<u32>,
    height: Option<u32>,
}

impl Declared {
    fn check(self, width: u32, height: u32) -> std::result::Result<(), RequestError> {
        let dims = [("width", self.width, width), ("height", self.height, height)];
        for (field, declared, actual) in dims {
            match declared {
                Some(declared) if declared != actual => {
                    return Err(RequestError::DimensionMismatch {
                        field,
                        declared,
                        actual,
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Decode and classify `bytes` off the async workers
async fn classify(
    state: web::Data<AppState>,
    bytes: Vec<u8>,
    declared: Declared,
) -> Result<Vec<Class>> {
    let start = Instant::now();
    let size = bytes.len();

    let classes = web::block(move || -> anyhow::Result<Vec<Class>> {
        let image = preprocess::decode_image(&bytes, state.max_upload_bytes)?;
        debug!("decoded {}x{} image", image.width(), image.height());
        declared.check(image.width(), image.height())?;
        state.classifier.classify(&image)
    })
    .await
    .map_err(|e| anyhow!("inference was cancelled: {e}"))?;

    let classes = classes.map_err(|e| {
        warn!("classification failed: {e:#}");
        e
    })?;

    info!(
        "classified {size} byte upload in {:?}, top class {:?}",
        start.elapsed(),
        classes.first().map(|c| &c.label)
    );
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::preprocess::test::solid_png;
    use crate::server::{self, protocol::Prediction};
    use crate::torch::test::untrained_classifier;
    use actix_web::http::{header, StatusCode};
    use actix_web::{test, App};

    const BOUNDARY: &str = "----imgclass-test-boundary";

    fn multipart_body(fields: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, data) in fields {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match filename {
                Some(f) => format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n"),
                None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(fields: &[(&str, Option<&str>, &[u8])]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/predict")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body(fields))
    }

    fn state(settings: &Settings) -> web::Data<AppState> {
        web::Data::new(AppState::new(untrained_classifier(settings), settings))
    }

    macro_rules! app {
        ($settings:expr) => {
            test::init_service(
                App::new()
                    .app_data(state(&$settings))
                    .configure(server::configure($settings.server.max_upload_bytes)),
            )
            .await
        };
    }

    fn assert_ranked(predictions: &[Prediction], n: usize) {
        assert_eq!(predictions.len(), n);
        assert!(predictions
            .windows(2)
            .all(|w| w[0].confidence >= w[1].confidence));
        assert!(predictions
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.confidence) && !p.class.is_empty()));
    }

    #[actix_web::test]
    async fn test_root() {
        let settings = Settings::default();
        let app = app!(settings);
        let req = test::TestRequest::get().uri("/").to_request();
        let res: HealthResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(res.message, "Image Classification API is running");
    }

    #[actix_web::test]
    async fn test_predict_upload() {
        let settings = Settings::default();
        let app = app!(settings);
        let png = solid_png(64, 48, [30, 160, 90]);

        let req = upload(&[("file", Some("leaf.png"), &png)]).to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: PredictResponse = test::read_body_json(res).await;
        assert_ranked(&body.predictions, 5);
    }

    #[actix_web::test]
    async fn test_predict_top_n_setting() {
        let mut settings = Settings::default();
        settings.model.top_n = 2;
        let app = app!(settings);
        let png = solid_png(10, 10, [0, 0, 0]);

        let req = upload(&[("file", Some("black.png"), &png)]).to_request();
        let body: PredictResponse = test::call_and_read_body_json(&app, req).await;
        assert_ranked(&body.predictions, 2);
    }

    #[actix_web::test]
    async fn test_predict_fallback_field() {
        let settings = Settings::default();
        let app = app!(settings);
        let png = solid_png(16, 16, [255, 255, 255]);

        let req = upload(&[
            ("note", None, b"hello"),
            ("image", Some("white.png"), &png),
        ])
        .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_predict_errors() {
        let mut settings = Settings::default();
        settings.server.max_upload_bytes = 256;
        let app = app!(settings);

        let req = upload(&[("file", Some("junk.png"), b"not an image at all")]).to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(res).await;
        assert!(body["errors"][0].as_str().unwrap().contains("unsupported"));

        let req = upload(&[("note", None, b"no file here")]).to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let big = vec![0u8; 1024];
        let req = upload(&[("file", Some("big.png"), &big)]).to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[actix_web::test]
    async fn test_predict_base64() {
        let settings = Settings::default();
        let app = app!(settings);
        let png = solid_png(40, 40, [12, 34, 56]);

        let req = test::TestRequest::post()
            .uri("/predict/base64")
            .set_json(protocol::B64Image {
                image: general_purpose::STANDARD.encode(&png),
                height: None,
                width: None,
            })
            .to_request();
        let body: PredictResponse = test::call_and_read_body_json(&app, req).await;
        assert_ranked(&body.predictions, 5);

        let req = test::TestRequest::post()
            .uri("/predict/base64")
            .set_json(protocol::B64Image {
                image: "%%% not base64 %%%".into(),
                height: None,
                width: None,
            })
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_predict_base64_dimensions() {
        let settings = Settings::default();
        let app = app!(settings);
        let png = solid_png(40, 30, [12, 34, 56]);

        let req = test::TestRequest::post()
            .uri("/predict/base64")
            .set_json(protocol::B64Image {
                image: general_purpose::STANDARD.encode(&png),
                height: Some(30),
                width: Some(40),
            })
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/predict/base64")
            .set_json(protocol::B64Image {
                image: general_purpose::STANDARD.encode(&png),
                height: Some(30),
                width: Some(64),
            })
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(res).await;
        assert!(body["errors"][0].as_str().unwrap().contains("width is 40"));
    }

    #[actix_web::test]
    async fn test_oversized_json_body() {
        let mut settings = Settings::default();
        settings.server.max_upload_bytes = 256;
        let app = app!(settings);

        let req = test::TestRequest::post()
            .uri("/predict/base64")
            .set_json(protocol::B64Image {
                image: "A".repeat(5000),
                height: None,
                width: None,
            })
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = test::read_body_json(res).await;
        assert!(body["errors"][0].is_string());
    }

    #[actix_web::test]
    async fn test_predict_wrong_content_type() {
        let settings = Settings::default();
        let app = app!(settings);

        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload(r#"{"image": "abc"}"#)
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(res).await;
        assert!(body["errors"][0].is_string());
    }

    #[actix_web::test]
    async fn test_model_info() {
        let settings = Settings::default();
        let app = app!(settings);
        let req = test::TestRequest::get().uri("/model").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["format"], "weights");
        assert_eq!(body["input_size"], 224);
        assert_eq!(body["top_n"], 5);
        assert_eq!(body["normalization"], "imagenet");
        assert_eq!(body["classes"], 1000);
    }
}
