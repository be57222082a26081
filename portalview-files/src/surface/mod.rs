pub mod types;

#[cfg(test)]
mod tests;
