mod fixtures;
mod resume;
mod run;
