//! Movie storage collaborator
//!
//! The tool handlers only ever talk to a [`MovieStore`]. "Not found" and
//! "already exists" are ordinary outcomes carried in the return values;
//! `Err` is reserved for the store itself failing.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// A movie record, keyed by `title`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub title: String,
    pub year: i64,
    pub director: String,
    pub genre: String,
    pub rating: f64,
}

/// Partial update for an existing movie. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoviePatch {
    pub year: Option<i64>,
    pub director: Option<String>,
    pub genre: Option<String>,
    pub rating: Option<f64>,
}

impl MoviePatch {
    pub fn is_empty(&self) -> bool {
        self.year.is_none()
            && self.director.is_none()
            && self.genre.is_none()
            && self.rating.is_none()
    }

    fn apply(self, movie: &mut Movie) {
        if let Some(year) = self.year {
            movie.year = year;
        }
        if let Some(director) = self.director {
            movie.director = director;
        }
        if let Some(genre) = self.genre {
            movie.genre = genre;
        }
        if let Some(rating) = self.rating {
            movie.rating = rating;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Closed,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Read/write contract consumed by the movie tools.
///
/// `insert` and `update` must decide existence atomically with the write;
/// handlers never pair a `find` with a later write.
#[async_trait]
pub trait MovieStore: Send + Sync + 'static {
    async fn find(&self, title: &str) -> Result<Option<Movie>, StorageError>;

    async fn insert(&self, movie: Movie) -> Result<InsertOutcome, StorageError>;

    async fn update(&self, title: &str, patch: MoviePatch) -> Result<UpdateOutcome, StorageError>;

    async fn list_titles(&self) -> Result<Vec<String>, StorageError>;

    /// Release the backing connection. Called once during shutdown.
    async fn close(&self) -> Result<(), StorageError>;
}

/// In-process store. Titles are listed in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryMovieStore {
    movies: RwLock<IndexMap<String, Movie>>,
    closed: AtomicBool,
}

impl InMemoryMovieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with the demo catalog
    pub fn seeded() -> Self {
        Self::with_movies(seed_movies())
    }

    pub fn with_movies(movies: impl IntoIterator<Item = Movie>) -> Self {
        let movies = movies
            .into_iter()
            .map(|movie| (movie.title.clone(), movie))
            .collect();
        Self {
            movies: RwLock::new(movies),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MovieStore for InMemoryMovieStore {
    async fn find(&self, title: &str) -> Result<Option<Movie>, StorageError> {
        self.ensure_open()?;
        Ok(self.movies.read().await.get(title).cloned())
    }

    async fn insert(&self, movie: Movie) -> Result<InsertOutcome, StorageError> {
        self.ensure_open()?;
        let mut movies = self.movies.write().await;
        if movies.contains_key(&movie.title) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        movies.insert(movie.title.clone(), movie);
        Ok(InsertOutcome::Inserted)
    }

    async fn update(&self, title: &str, patch: MoviePatch) -> Result<UpdateOutcome, StorageError> {
        self.ensure_open()?;
        let mut movies = self.movies.write().await;
        match movies.get_mut(title) {
            Some(movie) => {
                patch.apply(movie);
                Ok(UpdateOutcome::Updated)
            }
            None => Ok(UpdateOutcome::NotFound),
        }
    }

    async fn list_titles(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        Ok(self.movies.read().await.keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Movie store closed");
        }
        Ok(())
    }
}

fn seed_movies() -> Vec<Movie> {
    vec![
        Movie {
            title: "The Matrix".into(),
            year: 1999,
            director: "The Wachowskis".into(),
            genre: "Science Fiction".into(),
            rating: 8.7,
        },
        Movie {
            title: "Inception".into(),
            year: 2010,
            director: "Christopher Nolan".into(),
            genre: "Science Fiction".into(),
            rating: 8.8,
        },
        Movie {
            title: "The Godfather".into(),
            year: 1972,
            director: "Francis Ford Coppola".into(),
            genre: "Crime Drama".into(),
            rating: 9.2,
        },
    ]
}
