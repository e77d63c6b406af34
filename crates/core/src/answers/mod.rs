//! Answers-file bookkeeping.

pub mod store;

pub use store::{
    check_answer_keys, parse_document, render_document, AnswersStore, PreparedAnswers, ANSWERS_HEADER,
};
