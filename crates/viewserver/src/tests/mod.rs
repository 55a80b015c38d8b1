mod support;

mod ddoc;
mod eval;
mod filters;
mod state;
