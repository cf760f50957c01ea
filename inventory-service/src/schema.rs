diesel::table! {
    inventory (product_id) {
        product_id -> Uuid,
        stock -> Int4,
        reserved -> Int4,
        reorder_threshold -> Nullable<Int4>,
        backorder_allowed -> Bool,
        last_adjustment_id -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    inventory_history (id) {
        id -> Uuid,
        product_id -> Uuid,
        operation -> Varchar,
        quantity -> Int4,
        previous_stock -> Int4,
        new_stock -> Int4,
        previous_reserved -> Int4,
        new_reserved -> Int4,
        adjustment_id -> Nullable<Varchar>,
        order_id -> Nullable<Uuid>,
        requested_reserved -> Nullable<Int4>,
        reason -> Nullable<Text>,
        notes -> Nullable<Text>,
        actor -> Varchar,
        response -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        result -> Nullable<Jsonb>,
        error -> Nullable<Text>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        product_id -> Uuid,
        order_id -> Uuid,
        quantity -> Int4,
        backordered -> Int4,
        status -> Varchar,
        expires_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(inventory_history -> inventory (product_id));
diesel::joinable!(reservations -> inventory (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    inventory_history,
    outbox_events,
    processed_commands,
    reservations,
);
