pub(crate) mod calendar;
pub(crate) mod callback;
pub(crate) mod health;
pub(crate) mod parse;
pub(crate) mod scrape;
