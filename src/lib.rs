//! # pairtune
//!
//! Pairwise preference (reward model) fine-tuning for GPT-2 style language
//! models, built on candle. A preference dataset of chosen/rejected completion
//! pairs is collated into 2N-row batches (first half chosen, second half
//! rejected), scored with a scalar value head, and trained against the
//! Bradley-Terry logistic ranking loss. A small axum server exposes a browser
//! chat demo for a fine-tuned model.

pub mod attention;
pub mod data;
pub mod generate;
pub mod loss;
pub mod model;
pub mod server;
pub mod train;
