//! Recipes: declarative package build descriptions

pub mod book;
pub mod manifest;

pub use book::{RecipeBook, RecipeSet, RecipeSource};
pub use manifest::{validate_name, Recipe};
