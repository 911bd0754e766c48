//! Movie catalog tools

use rmcp::model::{CallToolResult, Content, JsonObject};
use serde::Deserialize;
use std::sync::Arc;

use super::{InputSchema, ParamKind, ParamSpec, ToolDescriptor, ToolError, ToolRegistry};
use crate::storage::{InsertOutcome, Movie, MoviePatch, MovieStore, StorageError, UpdateOutcome};

const YEAR_RANGE: (f64, f64) = (1870.0, 2100.0);
const RATING_RANGE: (f64, f64) = (0.0, 10.0);

#[derive(Debug, Deserialize)]
struct TitleArgs {
    title: String,
}

#[derive(Debug, Deserialize)]
struct UpdateMovieArgs {
    title: String,
    year: Option<i64>,
    director: Option<String>,
    genre: Option<String>,
    rating: Option<f64>,
}

impl UpdateMovieArgs {
    fn into_parts(self) -> (String, MoviePatch) {
        let patch = MoviePatch {
            year: self.year,
            director: self.director,
            genre: self.genre,
            rating: self.rating,
        };
        (self.title, patch)
    }
}

/// Registry exposing the four catalog tools backed by `store`
pub fn movie_registry(store: Arc<dyn MovieStore>) -> Result<ToolRegistry, ToolError> {
    let mut builder = ToolRegistry::builder();
    builder
        .register(add_movie(store.clone()))?
        .register(get_movie_info(store.clone()))?
        .register(list_movies(store.clone()))?
        .register(update_movie(store))?;
    Ok(builder.build())
}

fn text(message: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(message)])
}

fn pretty<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Backend(format!("failed to encode record: {e}")))
}

fn title_param() -> ParamSpec {
    ParamSpec::required("title", ParamKind::String, "The title of the movie")
}

fn add_movie(store: Arc<dyn MovieStore>) -> ToolDescriptor {
    let schema = InputSchema::new(vec![
        title_param(),
        ParamSpec::required("year", ParamKind::Integer, "The release year of the movie")
            .with_range(YEAR_RANGE.0, YEAR_RANGE.1),
        ParamSpec::required("director", ParamKind::String, "The director of the movie"),
        ParamSpec::required("genre", ParamKind::String, "The genre of the movie"),
        ParamSpec::required("rating", ParamKind::Number, "The rating of the movie (0-10)")
            .with_range(RATING_RANGE.0, RATING_RANGE.1),
    ]);

    ToolDescriptor::new(
        "add_movie",
        "Add a new movie to the database",
        schema,
        move |movie: Movie| {
            let store = store.clone();
            async move {
                let title = movie.title.clone();
                match store.insert(movie).await? {
                    InsertOutcome::Inserted => Ok(text(format!(
                        "Movie \"{title}\" successfully added to the database."
                    ))),
                    InsertOutcome::AlreadyExists => Ok(text(format!(
                        "Movie \"{title}\" already exists in the database."
                    ))),
                }
            }
        },
    )
}

fn get_movie_info(store: Arc<dyn MovieStore>) -> ToolDescriptor {
    ToolDescriptor::new(
        "get_movie_info",
        "Get information about a movie",
        InputSchema::new(vec![title_param()]),
        move |TitleArgs { title }: TitleArgs| {
            let store = store.clone();
            async move {
                match store.find(&title).await? {
                    Some(movie) => Ok(text(pretty(&movie)?)),
                    None => Ok(text(format!("Movie \"{title}\" not found in the database."))),
                }
            }
        },
    )
}

fn list_movies(store: Arc<dyn MovieStore>) -> ToolDescriptor {
    ToolDescriptor::new(
        "list_movies",
        "List all movies in the database",
        InputSchema::empty(),
        move |_args: JsonObject| {
            let store = store.clone();
            async move {
                let titles = store.list_titles().await?;
                Ok(text(pretty(&titles)?))
            }
        },
    )
}

fn update_movie(store: Arc<dyn MovieStore>) -> ToolDescriptor {
    let schema = InputSchema::new(vec![
        title_param(),
        ParamSpec::optional("year", ParamKind::Integer, "The new release year")
            .with_range(YEAR_RANGE.0, YEAR_RANGE.1),
        ParamSpec::optional("director", ParamKind::String, "The new director"),
        ParamSpec::optional("genre", ParamKind::String, "The new genre"),
        ParamSpec::optional("rating", ParamKind::Number, "The new rating (0-10)")
            .with_range(RATING_RANGE.0, RATING_RANGE.1),
    ]);

    ToolDescriptor::new(
        "update_movie",
        "Update fields of an existing movie",
        schema,
        move |args: UpdateMovieArgs| {
            let store = store.clone();
            async move {
                let (title, patch) = args.into_parts();
                if patch.is_empty() {
                    return Ok(text(format!(
                        "No fields provided to update for movie \"{title}\"."
                    )));
                }
                match store.update(&title, patch).await? {
                    UpdateOutcome::Updated => {
                        Ok(text(format!("Movie \"{title}\" successfully updated.")))
                    }
                    UpdateOutcome::NotFound => {
                        Ok(text(format!("Movie \"{title}\" not found in the database.")))
                    }
                }
            }
        },
    )
}
