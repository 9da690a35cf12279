// Manual-mode fallback
pub mod manual_mode;

// Kelly-capped contract sizing
pub mod position_sizer;

// Unified entry gate
pub mod risk_manager;
