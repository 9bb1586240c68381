use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use serde_with::{serde_as, NoneAsEmptyString};
use tracing::info;

use crate::{
    auth::CurrentUser,
    backend::photo_object_name,
    error::AppError,
    models::{
        appointment::ServiceKind,
        pet::{Pet, PetDraft, PetSize},
    },
    routes::{format_timestamp, SelectOption},
    state::AppState,
};

pub const MAX_PHOTO_BYTES: usize = 5 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(pets_list).post(pet_create))
        .route("/:id", get(pet_detail).post(pet_update))
        .route("/:id/delete", post(pet_delete))
        .route(
            "/:id/photo",
            post(pet_photo_upload).layer(DefaultBodyLimit::max(MAX_PHOTO_BYTES + 1024 * 1024)),
        )
}

#[derive(Clone)]
struct PetRow {
    id: String,
    name: String,
    species: String,
    breed: String,
    size: String,
    has_photo: bool,
    photo_url: String,
}

impl From<&Pet> for PetRow {
    fn from(pet: &Pet) -> Self {
        Self {
            id: pet.id.clone(),
            name: pet.name.clone(),
            species: pet.species.clone(),
            breed: pet.breed_text().to_string(),
            size: pet.size.to_string(),
            has_photo: pet.photo_url.is_some(),
            photo_url: pet.photo_url.clone().unwrap_or_default(),
        }
    }
}

/// Values shown in the pet form, either from a stored pet or a rejected submit.
#[derive(Clone, Default)]
struct PetFormValues {
    name: String,
    species: String,
    breed: String,
    notes: String,
    sizes: Vec<SelectOption>,
}

impl PetFormValues {
    fn from_draft(draft: &PetDraft) -> Self {
        Self {
            name: draft.name.clone(),
            species: draft.species.clone(),
            breed: draft.breed.clone().unwrap_or_default(),
            notes: draft.notes.clone().unwrap_or_default(),
            sizes: size_options(draft.size),
        }
    }

    fn from_pet(pet: &Pet) -> Self {
        Self {
            name: pet.name.clone(),
            species: pet.species.clone(),
            breed: pet.breed.clone().unwrap_or_default(),
            notes: pet.notes_display().to_string(),
            sizes: size_options(pet.size),
        }
    }

    fn blank() -> Self {
        Self {
            sizes: size_options(PetSize::default()),
            ..Self::default()
        }
    }
}

fn size_options(selected: PetSize) -> Vec<SelectOption> {
    PetSize::ALL
        .into_iter()
        .map(|size| SelectOption {
            value: size.as_str().to_string(),
            label: size.as_str().to_string(),
            selected: size == selected,
        })
        .collect()
}

#[serde_as]
#[derive(Deserialize)]
struct PetForm {
    name: String,
    species: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    breed: Option<String>,
    size: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    notes: Option<String>,
}

impl PetForm {
    fn into_draft(self) -> Result<PetDraft, (PetDraft, String)> {
        let size = self.size.parse::<PetSize>();
        let draft = PetDraft {
            name: self.name.trim().to_string(),
            species: self.species.trim().to_string(),
            breed: self.breed.map(|b| b.trim().to_string()),
            size: size.as_ref().copied().unwrap_or_default(),
            notes: self.notes.map(|n| n.trim().to_string()),
        };
        if let Err(message) = size {
            return Err((draft, message));
        }
        match draft.validate() {
            Ok(()) => Ok(draft),
            Err(message) => Err((draft, message)),
        }
    }
}

#[derive(Template)]
#[template(path = "pets/list.html")]
struct PetsListTemplate {
    pets: Vec<PetRow>,
    form: PetFormValues,
    show_error: bool,
    error_message: String,
}

async fn pets_list(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let pets = state.backend.list_pets(&user.caller).await?;
    Ok(AskamaTemplateResponse::into_response(PetsListTemplate {
        pets: pets.iter().map(PetRow::from).collect(),
        form: PetFormValues::blank(),
        show_error: false,
        error_message: String::new(),
    }))
}

async fn pet_create(
    State(state): State<AppState>,
    current: CurrentUser,
    Form(form): Form<PetForm>,
) -> Result<Response, AppError> {
    let user = current.require_user()?;
    let draft = match form.into_draft() {
        Ok(draft) => draft,
        Err((draft, message)) => {
            let pets = state.backend.list_pets(&user.caller).await?;
            return Ok((
                StatusCode::BAD_REQUEST,
                AskamaTemplateResponse::into_response(PetsListTemplate {
                    pets: pets.iter().map(PetRow::from).collect(),
                    form: PetFormValues::from_draft(&draft),
                    show_error: true,
                    error_message: message,
                }),
            )
                .into_response());
        }
    };
    let pet = state.backend.create_pet(&user.caller, draft).await?;
    info!(user_id = %user.id(), pet_id = %pet.id, "pet added");
    Ok(Redirect::to(&format!("/pets/{}", pet.id)).into_response())
}

#[derive(Template)]
#[template(path = "pets/detail.html")]
struct PetDetailTemplate {
    pet: PetRow,
    form: PetFormValues,
    created_at: String,
    services: Vec<SelectOption>,
    show_error: bool,
    error_message: String,
}

impl PetDetailTemplate {
    fn new(pet: &Pet, form: PetFormValues, error: Option<String>) -> Self {
        Self {
            pet: PetRow::from(pet),
            form,
            created_at: format_timestamp(pet.created_at),
            services: ServiceKind::ALL
                .into_iter()
                .map(|kind| SelectOption {
                    value: kind.as_str().to_string(),
                    label: kind.label().to_string(),
                    selected: false,
                })
                .collect(),
            show_error: error.is_some(),
            error_message: error.unwrap_or_default(),
        }
    }
}

async fn load_pet(state: &AppState, current: &CurrentUser, pet_id: &str) -> Result<Pet, AppError> {
    let user = current.require_user()?;
    state
        .backend
        .get_pet(&user.caller, pet_id)
        .await?
        .ok_or(AppError::NotFound)
}

async fn pet_detail(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(pet_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let pet = load_pet(&state, &current, &pet_id).await?;
    Ok(AskamaTemplateResponse::into_response(PetDetailTemplate::new(
        &pet,
        PetFormValues::from_pet(&pet),
        None,
    )))
}

async fn pet_update(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(pet_id): Path<String>,
    Form(form): Form<PetForm>,
) -> Result<Response, AppError> {
    let user = current.require_user()?;
    match form.into_draft() {
        Ok(draft) => {
            state.backend.update_pet(&user.caller, &pet_id, draft).await?;
            Ok(Redirect::to(&format!("/pets/{pet_id}")).into_response())
        }
        Err((draft, message)) => {
            let pet = load_pet(&state, &current, &pet_id).await?;
            Ok((
                StatusCode::BAD_REQUEST,
                AskamaTemplateResponse::into_response(PetDetailTemplate::new(
                    &pet,
                    PetFormValues::from_draft(&draft),
                    Some(message),
                )),
            )
                .into_response())
        }
    }
}

async fn pet_delete(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(pet_id): Path<String>,
) -> Result<Redirect, AppError> {
    let user = current.require_user()?;
    state.backend.delete_pet(&user.caller, &pet_id).await?;
    info!(user_id = %user.id(), %pet_id, "pet removed");
    Ok(Redirect::to("/pets"))
}

async fn pet_photo_upload(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(pet_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let pet = load_pet(&state, &current, &pet_id).await?;
    let user = current.require_user()?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(err.body_text()))?
    {
        if field.name() != Some("photo") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("photo").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::BadRequest(err.body_text()))?;
        upload = Some((file_name, content_type, bytes));
        break;
    }

    let (file_name, content_type, bytes) =
        upload.ok_or_else(|| AppError::BadRequest("Choose a photo to upload.".into()))?;
    let error = check_photo(&content_type, bytes.len());
    if let Some(message) = error {
        return Ok((
            StatusCode::BAD_REQUEST,
            AskamaTemplateResponse::into_response(PetDetailTemplate::new(
                &pet,
                PetFormValues::from_pet(&pet),
                Some(message),
            )),
        )
            .into_response());
    }

    let object = photo_object_name(user.id(), &pet.id, &file_name);
    let url = state
        .backend
        .upload_pet_photo(&user.caller, &object, &content_type, bytes.to_vec())
        .await?;
    state.backend.set_pet_photo(&user.caller, &pet.id, &url).await?;
    info!(user_id = %user.id(), pet_id = %pet.id, %object, "pet photo stored");
    Ok(Redirect::to(&format!("/pets/{}", pet.id)).into_response())
}

fn check_photo(content_type: &str, len: usize) -> Option<String> {
    if !content_type.starts_with("image/") {
        Some("Photos have to be images (JPEG, PNG, ...).".into())
    } else if len == 0 {
        Some("That file is empty.".into())
    } else if len > MAX_PHOTO_BYTES {
        Some("Photos are limited to 5 MB.".into())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(name: &str, size: &str, breed: Option<&str>) -> PetForm {
        PetForm {
            name: name.into(),
            species: "dog".into(),
            breed: breed.map(str::to_string),
            size: size.into(),
            notes: None,
        }
    }

    #[test]
    fn form_trims_and_validates() {
        let draft = form("  Biscuit ", "large", Some(" Beagle ")).into_draft().unwrap();
        assert_eq!(draft.name, "Biscuit");
        assert_eq!(draft.size, PetSize::Large);
        assert_eq!(draft.breed.as_deref(), Some("Beagle"));

        let (kept, message) = form("Biscuit", "giant", None).into_draft().unwrap_err();
        assert_eq!(kept.name, "Biscuit");
        assert!(message.contains("giant"));

        assert!(form(" ", "small", None).into_draft().is_err());
    }

    #[test]
    fn empty_optional_fields_become_none() {
        let parsed: PetForm = serde_json::from_value(serde_json::json!({
            "name": "Biscuit",
            "species": "dog",
            "breed": "",
            "size": "small",
            "notes": "",
        }))
        .unwrap();
        assert!(parsed.breed.is_none());
        assert!(parsed.notes.is_none());
    }

    #[test]
    fn pet_names_stay_out_of_inline_scripts() {
        let pet = Pet {
            id: "pet-1".into(),
            owner_id: "owner-1".into(),
            name: "');alert(1);//".into(),
            species: "cat".into(),
            breed: None,
            size: PetSize::Small,
            notes: None,
            photo_url: None,
            created_at: chrono::Utc::now(),
        };
        let html = PetDetailTemplate::new(&pet, PetFormValues::from_pet(&pet), None)
            .render()
            .unwrap();
        let onsubmit = html
            .lines()
            .find(|line| line.contains("onsubmit="))
            .expect("delete form has a confirm handler");
        assert!(!onsubmit.contains("alert"), "{onsubmit}");
        assert!(!onsubmit.contains("&#x27;)"), "{onsubmit}");
    }

    #[test]
    fn photo_checks() {
        assert!(check_photo("image/png", 10).is_none());
        assert!(check_photo("application/pdf", 10).is_some());
        assert!(check_photo("image/jpeg", 0).is_some());
        assert!(check_photo("image/jpeg", MAX_PHOTO_BYTES + 1).is_some());
    }
}
