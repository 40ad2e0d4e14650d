diesel::table! {
    stock (id) {
        id -> Int8,
        goods_id -> Int8,
        total_stock -> Int8,
        reserved -> Int8,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_records (id) {
        id -> Int8,
        order_id -> Int8,
        goods_id -> Int8,
        num -> Int8,
        status -> Int2,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    stock,
    stock_records,
);
