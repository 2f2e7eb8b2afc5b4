//! HTTP handlers.
//!
//! | Route                              | Module         |
//! |------------------------------------|----------------|
//! | `POST /register`                   | [`users`]      |
//! | `GET /users`, `/users/{id}`        | [`users`]      |
//! | `PUT`/`DELETE /users/{id}`         | [`users`]      |
//! | `POST /mark-attendance`            | [`attendance`] |
//! | `GET /attendance-records`          | [`attendance`] |
//! | `POST /attendance-records/manual`  | [`attendance`] |

pub mod attendance;
pub mod users;

use std::collections::HashMap;

use axum::extract::Multipart;

use crate::error::AppError;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S";

/// A parsed multipart upload: text fields plus the `image` part.
pub(crate) struct Upload {
    fields: HashMap<String, String>,
    image: Option<Vec<u8>>,
}

impl Upload {
    pub async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut fields = HashMap::new();
        let mut image = None;

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "image" {
                image = Some(field.bytes().await?.to_vec());
            } else {
                fields.insert(name, field.text().await?);
            }
        }

        Ok(Self { fields, image })
    }

    /// A non-blank text field.
    pub fn required(&self, name: &str) -> Result<String, AppError> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation(format!("missing field: {name}")))
    }

    pub fn take_image(&mut self) -> Result<Vec<u8>, AppError> {
        self.image
            .take()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| AppError::Validation("missing field: image".into()))
    }
}
