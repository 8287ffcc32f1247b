//! SQL for the `quotes` relation.

// every read selects the columns `Quote::from_row` expects
macro_rules! select_quotes {
    ($($tail:literal),*) => {
        concat!("SELECT id, author, quote, created_at FROM quotes" $(, " ", $tail)*)
    };
}

pub const INSERT_QUOTE: &str =
    "INSERT INTO quotes (author, quote, created_at) VALUES ($1, $2, NOW()) RETURNING id";

// id breaks ties between rows committed within the same clock tick
pub const SELECT_ALL_QUOTES: &str = select_quotes!("ORDER BY created_at DESC, id DESC");

pub const SELECT_RANDOM_QUOTE: &str = select_quotes!("ORDER BY random() LIMIT 1");

pub const SELECT_QUOTES_BY_AUTHOR: &str =
    select_quotes!("WHERE author = $1", "ORDER BY created_at DESC, id DESC");

pub const DELETE_QUOTE: &str = "DELETE FROM quotes WHERE id = $1";
