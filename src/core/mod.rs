pub mod calendar;
pub mod callback;
pub mod correlation;
pub mod fetcher;
pub mod grist;
pub mod lifecycle;
pub mod llm;
pub mod orchestrator;
pub mod processor;
pub mod schemas;
pub mod tasks;
