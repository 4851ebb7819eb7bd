mod lifecycle;
mod queue;
mod race;
