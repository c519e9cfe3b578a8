pub mod mutex_pool;
pub mod task_counter;

/// `std::any::type_name` without the module path, for log lines.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Generic arguments carry paths of their own, only trim the outer type.
    let outer = full.split('<').next().unwrap_or(full);
    match outer.rfind("::") {
        Some(index) => &full[index + 2..],
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mesh;

    #[test]
    pub fn short_type_names() {
        assert_eq!(short_type_name::<Mesh>(), "Mesh");
        assert_eq!(short_type_name::<u32>(), "u32");
    }
}
